//! Polled-backend tests, driven by the softpoll environment.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

use iomgr::{
    iomanager, DriveBackend, IODevice, IoDeviceScope, IomgrError, IomgrState, IOInterface,
    IoThreadPtr, PolledQueuePair, ThreadRegex,
};
use iomgr_softpoll::{SoftBlockDesc, SoftPollEnv};

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
fn test_polled_start_with_external_env_does_not_reinit() {
    let _guard = serial();
    let env = SoftPollEnv::preinitialized();
    iomanager().set_polled_env(env.clone());

    iomanager().start(2, true, None, None).unwrap();
    assert_eq!(iomanager().get_state(), IomgrState::Running);
    assert_eq!(iomanager().worker_reactor_count(), 2);

    // Externally initialized: no init, no drive-subsystem kick.
    assert_eq!(env.init_calls(), 0);
    assert!(!env.drive_subsystem_up());
    assert_eq!(
        iomanager().default_drive_interface().unwrap().backend(),
        DriveBackend::Polled
    );

    iomanager().stop();
    env.teardown();
}

#[test]
fn test_polled_start_initializes_env_and_drive_subsystem() {
    let _guard = serial();
    let env = SoftPollEnv::new();
    iomanager().set_polled_env(env.clone());

    iomanager().start(2, true, None, None).unwrap();
    assert_eq!(iomanager().get_state(), IomgrState::Running);
    assert_eq!(env.init_calls(), 1);
    assert!(env.drive_subsystem_up());

    iomanager().stop();
    env.teardown();
}

#[test]
fn test_polled_env_init_failure_is_fatal() {
    let _guard = serial();
    let env = SoftPollEnv::failing();
    iomanager().set_polled_env(env);

    let err = iomanager().start(2, true, None, None).unwrap_err();
    assert!(matches!(err, IomgrError::InitFailure(_)));
    assert_eq!(iomanager().get_state(), IomgrState::Uninitialized);
}

#[test]
fn test_polled_multicast_and_least_busy() {
    let _guard = serial();
    let env = SoftPollEnv::preinitialized();
    iomanager().set_polled_env(env.clone());
    iomanager().start(2, true, None, None).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let sent = iomanager().run_on(
        ThreadRegex::AllWorker,
        move |_addr| {
            h.fetch_add(1, Ordering::Relaxed);
        },
        true,
    );
    assert_eq!(sent, 2);
    assert_eq!(hits.load(Ordering::Relaxed), 2);

    let sent = iomanager().run_on(ThreadRegex::LeastBusyWorker, |_addr| {}, true);
    assert_eq!(sent, 1);

    iomanager().stop();
    env.teardown();
}

#[test]
fn test_run_on_polled_shortcut() {
    let _guard = serial();
    let env = SoftPollEnv::preinitialized();
    iomanager().set_polled_env(env.clone());
    iomanager().start(2, true, None, None).unwrap();

    // Grab one polled endpoint off a worker.
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
    assert!(thr.backend.is_polled());

    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    assert!(iomanager().run_on_polled(
        &thr,
        Box::new(move || {
            r.fetch_add(1, Ordering::Relaxed);
        })
    ));
    assert!(wait_until(
        || ran.load(Ordering::Relaxed) == 1,
        Duration::from_secs(2)
    ));

    iomanager().stop();
    env.teardown();
}

#[test]
fn test_polled_device_identity_and_registration() {
    let _guard = serial();
    let env = SoftPollEnv::preinitialized();
    iomanager().set_polled_env(env.clone());
    iomanager().start(2, true, None, None).unwrap();

    let iface = iomanager().generic_interface().unwrap();
    let dyn_iface: std::sync::Arc<dyn IOInterface> = iface.clone();

    let desc = SoftBlockDesc::new("softblk0");
    let dev = IODevice::block_device(desc, IoDeviceScope::Global, &dyn_iface);
    assert_eq!(dev.dev_id(), "softblk0");
    assert!(dev.is_global());

    let before = iface.device_count();
    iface.add_io_device(dev.clone(), true);
    assert_eq!(iface.device_count(), before + 1);
    iface.remove_io_device(&dev, true);
    assert_eq!(iface.device_count(), before);

    struct Qp;
    impl PolledQueuePair for Qp {}
    let qp_dev = IODevice::queue_pair(
        std::sync::Arc::new(Qp),
        IoDeviceScope::Global,
        &dyn_iface,
    );
    assert_eq!(qp_dev.dev_id(), "");

    iomanager().stop();
    env.teardown();
}

#[test]
fn test_polled_thread_timer_via_reactor() {
    let _guard = serial();
    let env = SoftPollEnv::preinitialized();
    iomanager().set_polled_env(env.clone());
    iomanager().start(1, true, None, None).unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let f = fired.clone();
    iomanager().run_on(
        ThreadRegex::AllWorker,
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
        },
        true,
    );

    assert!(wait_until(
        || fired.load(Ordering::Relaxed) == 1,
        Duration::from_secs(2)
    ));

    iomanager().stop();
    env.teardown();
}
