//! Event-backend lifecycle and message-routing tests.
//!
//! The manager is a process-wide singleton, so every test here serializes
//! on one lock and leaves the manager stopped behind itself.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use iomgr::{
    iomanager, DriveBackend, IOInterface, IomgrMsg, IomgrState, IoThreadPtr, MsgKind, SyncMsg,
    ThreadRegex,
};

fn serial() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner())
}

fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_start_brings_up_workers_and_interfaces() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    assert_eq!(iomanager().get_state(), IomgrState::Running);
    assert_eq!(iomanager().worker_reactor_count(), 4);

    // generic + default drive interface
    assert_eq!(iomanager().num_interfaces(), 2);
    let mut names = Vec::new();
    iomanager().foreach_interface(|iface| names.push(iface.name()));
    assert!(names.contains(&"generic"));
    assert!(names.contains(&"drive_event"));
    assert_eq!(
        iomanager().default_drive_interface().unwrap().backend(),
        DriveBackend::Event
    );

    iomanager().stop();
    assert_eq!(iomanager().get_state(), IomgrState::Stopped);
}

#[test]
fn test_multicast_all_worker_reaches_each_thread_once() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let sent = iomanager().run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            h.fetch_add(1, Ordering::Relaxed);
        },
        true,
    );
    assert_eq!(sent, 4);
    assert_eq!(hits.load(Ordering::Relaxed), 4);

    iomanager().stop();
}

#[test]
fn test_multicast_with_registered_module() {
    let _guard = serial();
    iomanager().start(3, false, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = iomanager()
        .register_msg_module(Arc::new(move |_msg| {
            h.fetch_add(1, Ordering::Relaxed);
        }))
        .unwrap();

    let smsg = SyncMsg::new(MsgKind::Custom(7), id);
    let sent = iomanager().multicast_msg_and_wait(ThreadRegex::AllWorker, &smsg);
    assert_eq!(sent, 3);
    assert_eq!(hits.load(Ordering::Relaxed), 3);

    iomanager().stop();
}

#[test]
fn test_least_busy_worker_spreads_over_distinct_threads() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    // Each handler pins a load onto the thread it ran on, so the next
    // least-busy pick must land elsewhere.
    let seen = Arc::new(Mutex::new(HashSet::new()));
    for _ in 0..4 {
        let seen = seen.clone();
        let sent = iomanager().run_on(
            ThreadRegex::LeastBusyWorker,
            move |_addr| {
                let thr = iomanager().iothread_self().unwrap();
                thr.incr_pending(1000);
                seen.lock().unwrap().insert(thr.thread_idx);
            },
            true,
        );
        assert_eq!(sent, 1);
    }
    assert_eq!(seen.lock().unwrap().len(), 4);

    iomanager().stop();
}

#[test]
fn test_random_worker_delivers_exactly_once() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    for _ in 0..8 {
        let h = hits.clone();
        let smsg = SyncMsg::generic(iomanager().internal_module_id(), move |_addr| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let sent = iomanager().multicast_msg_and_wait(ThreadRegex::RandomWorker, &smsg);
        assert_eq!(sent, 1);
    }
    assert_eq!(hits.load(Ordering::Relaxed), 8);

    iomanager().stop();
}

#[test]
fn test_multicast_all_user_with_no_user_reactors_is_zero() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let sent = iomanager().run_on(ThreadRegex::AllUser, |_addr| {}, true);
    assert_eq!(sent, 0);

    iomanager().stop();
}

#[test]
fn test_send_to_self_off_reactor_thread_fails_cleanly() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    assert!(iomanager().iothread_self().is_none());
    let msg = IomgrMsg::new(MsgKind::Generic, iomanager().internal_module_id());
    assert!(!iomanager().send_to_self(msg));

    iomanager().stop();
}

#[test]
fn test_no_message_leaks_through_multicast() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    let payload = Arc::new(());
    {
        let p = payload.clone();
        let smsg = SyncMsg::generic(iomanager().internal_module_id(), move |_addr| {
            let _ = &p;
        });
        let sent = iomanager().multicast_msg_and_wait(ThreadRegex::AllWorker, &smsg);
        assert_eq!(sent, 4);
        // Every delivered copy is freed before its ack; only the SyncMsg
        // base copy remains.
        assert_eq!(Arc::strong_count(&payload), 2);
    }
    assert_eq!(Arc::strong_count(&payload), 1);

    iomanager().stop();
}

#[test]
fn test_stop_is_idempotent_and_restart_works() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();
    iomanager().stop();
    assert_eq!(iomanager().get_state(), IomgrState::Stopped);
    assert_eq!(iomanager().worker_reactor_count(), 0);

    // Second stop is a warning no-op.
    iomanager().stop();
    assert_eq!(iomanager().get_state(), IomgrState::Stopped);

    // And the cycle runs again.
    iomanager().start(3, false, None, None).unwrap();
    assert_eq!(iomanager().get_state(), IomgrState::Running);
    assert_eq!(iomanager().worker_reactor_count(), 3);

    let sent = iomanager().run_on(ThreadRegex::AllWorker, |_addr| {}, true);
    assert_eq!(sent, 3);

    iomanager().stop();
}

#[test]
fn test_start_while_running_is_a_noop() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();
    assert_eq!(iomanager().worker_reactor_count(), 2);

    iomanager().start(8, false, None, None).unwrap();
    assert_eq!(iomanager().worker_reactor_count(), 2);

    iomanager().stop();
}

#[test]
fn test_thread_state_notifier_fires_per_io_thread() {
    let _guard = serial();
    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let (s1, s2) = (started.clone(), stopped.clone());

    iomanager()
        .start(
            4,
            false,
            Some(Arc::new(move |up| {
                if up {
                    s1.fetch_add(1, Ordering::Relaxed);
                } else {
                    s2.fetch_add(1, Ordering::Relaxed);
                }
            })),
            None,
        )
        .unwrap();

    // The started broadcast is not waited on by start().
    assert!(wait_until(
        || started.load(Ordering::Relaxed) == 4,
        Duration::from_secs(2)
    ));

    iomanager().stop();
    assert_eq!(stopped.load(Ordering::Relaxed), 4);
}

#[test]
fn test_interface_added_after_start_sees_every_thread() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    struct CountingIface {
        starts: AtomicUsize,
        stops: AtomicUsize,
    }
    impl IOInterface for CountingIface {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn on_io_thread_start(&self, _thr: &IoThreadPtr) {
            self.starts.fetch_add(1, Ordering::Relaxed);
        }
        fn on_io_thread_stop(&self, _thr: &IoThreadPtr) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    let iface = Arc::new(CountingIface {
        starts: AtomicUsize::new(0),
        stops: AtomicUsize::new(0),
    });
    iomanager().add_interface(iface.clone());
    assert_eq!(iface.starts.load(Ordering::Relaxed), 4);
    assert_eq!(iomanager().num_interfaces(), 3);

    iomanager().stop();
    assert_eq!(iface.stops.load(Ordering::Relaxed), 4);
}

#[test]
fn test_thread_idx_unique_across_workers() {
    let _guard = serial();
    iomanager().start(4, false, None, None).unwrap();

    let idxs = Arc::new(Mutex::new(Vec::new()));
    let i = idxs.clone();
    let sent = iomanager().run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            let thr = iomanager().iothread_self().unwrap();
            i.lock().unwrap().push(thr.thread_idx);
        },
        true,
    );
    assert_eq!(sent, 4);

    let mut got = idxs.lock().unwrap().clone();
    got.sort();
    got.dedup();
    assert_eq!(got.len(), 4);

    iomanager().stop();
}

#[test]
fn test_user_reactor_joins_all_user_group() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let user = std::thread::spawn(|| {
        iomanager().run_user_io_loop(None).unwrap();
    });

    // Wait for the user reactor to come up, then address it.
    assert!(wait_until(
        || iomanager().run_on(ThreadRegex::AllUser, |_addr| {}, true) == 1,
        Duration::from_secs(2)
    ));

    // all_io covers workers and the user thread.
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let sent = iomanager().run_on(
        ThreadRegex::AllIo,
        move |_addr| {
            h.fetch_add(1, Ordering::Relaxed);
        },
        true,
    );
    assert_eq!(sent, 3);
    assert_eq!(hits.load(Ordering::Relaxed), 3);

    // least_busy_io ranges over workers and users alike.
    let sent = iomanager().run_on(ThreadRegex::LeastBusyIo, |_addr| {}, true);
    assert_eq!(sent, 1);

    // stop() relinquishes the user loop too.
    iomanager().stop();
    user.join().unwrap();
}

#[test]
fn test_send_msg_after_stop_returns_false() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let slot: Arc<Mutex<Option<IoThreadPtr>>> = Arc::new(Mutex::new(None));
    let s = slot.clone();
    iomanager().run_on(
        ThreadRegex::LeastBusyWorker,
        move |_addr| {
            *s.lock().unwrap() = Some(iomanager().iothread_self().unwrap());
        },
        true,
    );
    let thr = slot.lock().unwrap().take().unwrap();

    iomanager().stop();

    let msg = IomgrMsg::new(MsgKind::Generic, iomanager().internal_module_id());
    assert!(!iomanager().send_msg(&thr, msg));
}
