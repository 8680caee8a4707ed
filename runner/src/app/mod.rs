//! Application lifecycle: options, shared state, the serve loop and the
//! wiring of a production [`Deployer`](crate::deploy::Deployer).

pub mod options;
pub mod run;
pub mod setup;
pub mod state;
