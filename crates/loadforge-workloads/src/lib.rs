#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Concrete workload definitions built against the task engine (C1) and the
//! narrow SQL/KVS capability interfaces (C9): RandomRW and sysbench.
//!
//! These demonstrate the capability contract; they are not numbered core
//! components themselves.

pub mod random_rw;
pub mod sysbench;

/// Error parsing or executing a workload's configuration knobs.
#[derive(Debug, thiserror::Error)]
#[error("workload error: {0}")]
pub struct WorkloadError(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use loadforge_core::{KvsBackend, KvsError};
    use loadforge_engine::{stop_channel, Runner, TaskTree};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    struct InMemoryKvs {
        data: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
    }

    impl InMemoryKvs {
        fn new() -> Self {
            Self {
                data: Mutex::new(HashMap::new()),
            }
        }
    }

    impl KvsBackend for InMemoryKvs {
        fn exists(&self, key: &[u8]) -> Result<bool, KvsError> {
            Ok(self.data.lock().unwrap().contains_key(key))
        }
        fn set(&self, key: &[u8], value: &[u8]) -> Result<(), KvsError> {
            self.data.lock().unwrap().insert(key.to_vec(), value.to_vec());
            Ok(())
        }
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, KvsError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }
        fn rename(&self, src: &[u8], dst: &[u8]) -> Result<(), KvsError> {
            let mut data = self.data.lock().unwrap();
            if let Some(value) = data.remove(src) {
                data.insert(dst.to_vec(), value);
            }
            Ok(())
        }
        fn delete_all(&self) -> Result<(), KvsError> {
            self.data.lock().unwrap().clear();
            Ok(())
        }
    }

    #[tokio::test]
    async fn random_rw_smoke_produces_read_write_ratio_near_config() {
        let kvs: Arc<dyn KvsBackend> = Arc::new(InMemoryKvs::new());
        let cfg = random_rw::RandomRwConfig {
            keys: 100,
            read: 4.0,
            write: 1.0,
        };
        random_rw::preload(&*kvs, &cfg, 0, 1).expect("preload");

        let tree = TaskTree::build(random_rw::build_tree(kvs, &cfg));
        let (tx, mut rx) = tokio::sync::mpsc::channel(8192);
        let (handle, stop_signal) = stop_channel();

        let mut runner = Runner::new(tree, tx, stop_signal);
        let run_task = tokio::task::spawn_blocking(move || {
            runner.run();
        });

        let reads = Arc::new(AtomicUsize::new(0));
        let writes = Arc::new(AtomicUsize::new(0));
        let reads_clone = reads.clone();
        let writes_clone = writes.clone();
        let collector = tokio::spawn(async move {
            while let Some(report) = rx.recv().await {
                match report.path.last().map(String::as_str) {
                    Some("read") => {
                        reads_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    Some("write") => {
                        writes_clone.fetch_add(1, Ordering::SeqCst);
                    }
                    _ => {}
                }
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        handle.request_stop().await;
        run_task.await.expect("runner task");
        collector.await.expect("collector task");

        let r = reads.load(Ordering::SeqCst) as f64;
        let w = writes.load(Ordering::SeqCst) as f64;
        assert!(r > 0.0 && w > 0.0, "expected both reads and writes, got r={r} w={w}");
        let ratio = r / w;
        assert!((2.0..8.0).contains(&ratio), "read/write ratio {ratio} far from expected 4:1");
    }
}
