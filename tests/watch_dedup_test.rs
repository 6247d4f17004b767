//! watch 去重测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use flare_registry_core::discovery::WatchManager;

const PREFIX: &str = "/flare/registry/production/default/ms2/";

/// 测试：不同线程并发查询同一前缀只建立一条 watch
#[test]
fn concurrent_acquire_starts_one_watch() {
    for _ in 0..50 {
        let manager = Arc::new(WatchManager::new());
        let started = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let workers: Vec<_> = (0..2)
            .map(|_| {
                let manager = manager.clone();
                let started = started.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    manager.acquire(PREFIX, |_, _| {
                        started.fetch_add(1, Ordering::SeqCst);
                    })
                })
            })
            .collect();
        let handles: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();

        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&handles[0], &handles[1]));
        assert_eq!(handles[0].ref_count(), 2);
        assert_eq!(manager.len(), 1);
    }
}

/// 测试：不同前缀各自建立 watch，全部释放后取消
#[test]
fn release_cancels_per_prefix() {
    let manager = WatchManager::new();
    let other = "/flare/registry/production/default/ms3/";

    let first = manager.acquire(PREFIX, |_, _| {});
    let second = manager.acquire(other, |_, _| {});
    manager.acquire(PREFIX, |_, _| panic!("watch started twice"));
    assert_eq!(manager.len(), 2);

    manager.release(PREFIX);
    assert!(!first.is_cancelled());
    manager.release(PREFIX);
    assert!(first.is_cancelled());
    assert!(!manager.contains(PREFIX));

    manager.shutdown();
    assert!(second.is_cancelled());
    assert!(manager.is_empty());
}

/// 测试：取消令牌传给 watch 任务
#[test]
fn start_receives_cancellation() {
    let manager = WatchManager::new();
    let mut token = None;
    let handle = manager.acquire(PREFIX, |prefix, feed| {
        assert_eq!(prefix, PREFIX);
        token = Some(feed.cancellation());
    });

    let token = token.unwrap();
    assert!(!token.is_cancelled());
    manager.release(handle.prefix());
    assert!(token.is_cancelled());
}
