//! Locks shared by independent lock factories and processes over one directory

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use hostrunner::filesys::dir::Dir;
use hostrunner::filesys::file::File;
use hostrunner::lock::{LockOptions, ResourceLocks};
use hostrunner::utils::CooldownOptions;

fn options() -> LockOptions {
    LockOptions {
        retries: 500,
        cooldown: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
        stale_after: Duration::from_secs(600),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_modify_write_is_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let shared = File::new(dir.path().join("ports.conf"));
    shared.write_string("").await.unwrap();

    let mut tasks = Vec::new();
    for worker in 0..4 {
        // a separate factory per worker, as separate processes would have
        let locks = ResourceLocks::new(Dir::new(dir.path().join("locks")), options());
        let shared = shared.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..10 {
                locks
                    .with_lock("ports", || async {
                        let before = shared.read_string().await?;
                        tokio::task::yield_now().await;
                        let line = format!("worker {} entry {}\n", worker, i);
                        shared.write_string(&(before + &line)).await
                    })
                    .await
                    .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let contents = shared.read_string().await.unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 40);
    for worker in 0..4 {
        for i in 0..10 {
            let expected = format!("worker {} entry {}", worker, i);
            assert!(lines.contains(&expected.as_str()), "missing {}", expected);
        }
    }
    assert!(!dir.path().join("locks").join("ports.lock").exists());
}

/// `<dir>|<worker>` for a child process running [`append_worker`]
const WORKER_ENV: &str = "HOSTRUNNER_LOCK_WORKER";
const ENTRIES_PER_PROCESS: usize = 25;

async fn append_entries(dir: &Path, worker: &str) {
    let locks = ResourceLocks::new(Dir::new(dir.join("locks")), options());
    let shared = File::new(dir.join("ports.conf"));
    for i in 0..ENTRIES_PER_PROCESS {
        locks
            .with_lock("ports", || async {
                let before = shared.read_string().await?;
                tokio::time::sleep(Duration::from_millis(1)).await;
                let line = format!("process {} entry {}\n", worker, i);
                shared.write_string(&(before + &line)).await
            })
            .await
            .unwrap();
    }
}

/// Body of the child processes; does nothing in a regular test run
#[tokio::test]
async fn append_worker() {
    let Ok(job) = std::env::var(WORKER_ENV) else {
        return;
    };
    let (dir, worker) = job.split_once('|').unwrap();
    append_entries(Path::new(dir), worker).await;
}

#[tokio::test]
async fn test_processes_serialize_appends() {
    let dir = tempfile::tempdir().unwrap();
    File::new(dir.path().join("ports.conf"))
        .write_string("")
        .await
        .unwrap();

    let exe = std::env::current_exe().unwrap();
    let children: Vec<_> = ["a", "b"]
        .iter()
        .map(|worker| {
            tokio::process::Command::new(&exe)
                .args(["append_worker", "--exact", "--test-threads=1"])
                .env(WORKER_ENV, format!("{}|{}", dir.path().display(), worker))
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .spawn()
                .unwrap()
        })
        .collect();
    for mut child in children {
        assert!(child.wait().await.unwrap().success());
    }

    let contents = File::new(dir.path().join("ports.conf"))
        .read_string()
        .await
        .unwrap();
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2 * ENTRIES_PER_PROCESS, "{}", contents);
    for worker in ["a", "b"] {
        for i in 0..ENTRIES_PER_PROCESS {
            let expected = format!("process {} entry {}", worker, i);
            assert!(lines.contains(&expected.as_str()), "missing {}", expected);
        }
    }
}
