//! iomgr demo: start a reactor pool, fan work across it, tick a global
//! timer, then shut down.
//!
//! ```text
//! iomgr-demo [--polled] [num_threads]
//! IOMGR_LOG=debug iomgr-demo 4
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use iomgr::{iomanager, ThreadRegex};
use iomgr_softpoll::SoftPollEnv;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("IOMGR_LOG")
                .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut is_polled = false;
    let mut num_threads = 4usize;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--polled" => is_polled = true,
            other => {
                num_threads = other.parse().unwrap_or_else(|_| {
                    eprintln!("usage: iomgr-demo [--polled] [num_threads]");
                    std::process::exit(2);
                })
            }
        }
    }

    if is_polled {
        iomanager().set_polled_env(SoftPollEnv::new());
    }

    iomanager()
        .start(num_threads, is_polled, None, None)
        .expect("iomgr start failed");

    // Fan a ping across every worker and wait for all of them.
    let pings = Arc::new(AtomicUsize::new(0));
    let p = pings.clone();
    let sent = iomanager().run_on(
        ThreadRegex::AllWorker,
        move |addr| {
            let thr = iomanager().iothread_self().unwrap();
            info!(addr, thread_idx = thr.thread_idx, "ping");
            p.fetch_add(1, Ordering::Relaxed);
        },
        true,
    );
    info!(sent, acked = pings.load(Ordering::Relaxed), "fan-out done");

    // Least-busy routing: a burst of one-off jobs.
    for job in 0..8 {
        iomanager().run_on(
            ThreadRegex::LeastBusyWorker,
            move |_addr| {
                let thr = iomanager().iothread_self().unwrap();
                info!(job, thread_idx = thr.thread_idx, "job ran");
            },
            true,
        );
    }

    // A recurring global timer, ticking every worker.
    let ticks = Arc::new(AtomicUsize::new(0));
    let t = ticks.clone();
    let handle = iomanager()
        .schedule_global_timer(
            Duration::from_millis(50),
            true,
            None,
            ThreadRegex::AllWorker,
            Arc::new(move |_cookie| {
                t.fetch_add(1, Ordering::Relaxed);
            }),
        )
        .expect("global timer");

    std::thread::sleep(Duration::from_millis(300));
    iomanager().cancel_global_timer(ThreadRegex::AllWorker, handle);
    info!(ticks = ticks.load(Ordering::Relaxed), "timer cancelled");

    iomanager().stop();
    info!("done");
}
