//! Global and per-thread timer tests over the event backend.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use iomgr::{iomanager, IomgrError, ThreadRegex, TimerHandle};

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
fn test_global_oneshot_fires_on_every_worker() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    iomanager()
        .schedule_global_timer(
            Duration::from_millis(10),
            false,
            None,
            ThreadRegex::AllWorker,
            Arc::new(move |_cookie| {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

    // One fire, multicast to both workers.
    assert!(wait_until(
        || hits.load(Ordering::Relaxed) == 2,
        Duration::from_secs(2)
    ));
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::Relaxed), 2);

    iomanager().stop();
}

#[test]
fn test_global_recurring_fires_repeatedly_until_cancel() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let handle = iomanager()
        .schedule_global_timer(
            Duration::from_millis(20),
            true,
            None,
            ThreadRegex::AllWorker,
            Arc::new(move |_cookie| {
                h.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .unwrap();

    // An idle 300ms window holds 15 periods; each fire lands on both
    // workers. Demand a conservative floor to stay robust under load.
    std::thread::sleep(Duration::from_millis(300));
    assert!(
        hits.load(Ordering::Relaxed) >= 10,
        "recurring timer fired only {} times",
        hits.load(Ordering::Relaxed)
    );

    assert!(iomanager().cancel_global_timer(ThreadRegex::AllWorker, handle));
    std::thread::sleep(Duration::from_millis(60));
    let settled = hits.load(Ordering::Relaxed);
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(hits.load(Ordering::Relaxed), settled);

    iomanager().stop();
}

#[test]
fn test_global_timer_cookie_reaches_callback() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    iomanager()
        .schedule_global_timer(
            Duration::from_millis(10),
            false,
            Some(Arc::new(31u64)),
            ThreadRegex::AllWorker,
            Arc::new(move |cookie| {
                let v = cookie.and_then(|c| c.downcast_ref::<u64>().copied());
                s.lock().unwrap().push(v);
            }),
        )
        .unwrap();

    assert!(wait_until(
        || seen.lock().unwrap().len() == 2,
        Duration::from_secs(2)
    ));
    assert!(seen.lock().unwrap().iter().all(|v| *v == Some(31)));

    iomanager().stop();
}

#[test]
fn test_global_timer_rejects_bad_selector() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let err = iomanager()
        .schedule_global_timer(
            Duration::from_millis(10),
            false,
            None,
            ThreadRegex::LeastBusyWorker,
            Arc::new(|_cookie| {}),
        )
        .unwrap_err();
    assert!(matches!(err, IomgrError::Configuration(_)));

    iomanager().stop();
}

#[test]
fn test_thread_timer_fires_and_cancels() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let cancelled_handle: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

    // Arm one short timer and one long-cancelled one on the same worker.
    let f = fired.clone();
    let ch = cancelled_handle.clone();
    iomanager().run_on(
        ThreadRegex::LeastBusyWorker,
        move |_addr| {
            let f = f.clone();
            iomanager()
                .schedule_thread_timer(
                    Duration::from_millis(10),
                    false,
                    None,
                    Arc::new(move |_cookie| {
                        f.fetch_add(1, Ordering::Relaxed);
                    }),
                )
                .unwrap();

            let h = iomanager()
                .schedule_thread_timer(
                    Duration::from_secs(60),
                    false,
                    None,
                    Arc::new(|_cookie| panic!("cancelled timer fired")),
                )
                .unwrap();
            assert!(iomanager().cancel_thread_timer(h));
            *ch.lock().unwrap() = Some(h);
        },
        true,
    );

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) == 1,
        Duration::from_secs(2)
    ));
    assert!(cancelled_handle.lock().unwrap().is_some());

    iomanager().stop();
}

#[test]
fn test_thread_timer_off_reactor_thread_is_an_error() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();

    let err = iomanager()
        .schedule_thread_timer(Duration::from_millis(10), false, None, Arc::new(|_| {}))
        .unwrap_err();
    assert!(matches!(err, IomgrError::Configuration(_)));

    iomanager().stop();
}

#[test]
fn test_global_timer_absent_after_stop() {
    let _guard = serial();
    iomanager().start(2, false, None, None).unwrap();
    iomanager().stop();

    let err = iomanager()
        .schedule_global_timer(
            Duration::from_millis(10),
            false,
            None,
            ThreadRegex::AllWorker,
            Arc::new(|_cookie| {}),
        )
        .unwrap_err();
    assert!(matches!(err, IomgrError::Configuration(_)));
}
