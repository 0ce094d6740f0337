//! Timers reposting pool work: ten timers across three priority queues,
//! each callback seeding a burst of pool items when it fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use meson_pool::{QueueHandle, ThreadPool};
use meson_timer::{IntervalIndex, Timer, TimerService};
use tracing::info;

const QUEUE_SIZE: usize = 32;

#[derive(Parser)]
#[command(about = "Flood three pool queues from expiring timers")]
struct Args {
    /// Pool worker threads.
    #[arg(short, long, default_value_t = 2)]
    workers: usize,
    /// How long to let timers fire before leaving.
    #[arg(short, long, default_value_t = 200)]
    run_millis: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let pool = Arc::new(ThreadPool::new(args.workers));
    let high = pool.new_queue(QUEUE_SIZE);
    let mid = pool.new_queue(QUEUE_SIZE);
    let low = pool.new_queue(QUEUE_SIZE);
    let service = TimerService::new(Arc::clone(&pool), high);

    let executed = Arc::new(AtomicU32::new(0));
    let fired = Arc::new(AtomicU32::new(0));

    // Timer n fires on queue n%3 and seeds up to 10*(n+1) pool items.
    let timers: Vec<Timer> = (0..10)
        .map(|n| {
            let queues: [QueueHandle; 3] = [high, mid, low];
            let queue = queues[n % 3];
            let pool = Arc::clone(&pool);
            let executed = Arc::clone(&executed);
            let fired = Arc::clone(&fired);
            Timer::new(&service, move || {
                fired.fetch_add(1, Ordering::SeqCst);
                let mut added = 0;
                {
                    let queues = pool.queues();
                    let queue = &queues[queue];
                    let access = queue.producer_access();
                    while added < 10 * (n + 1) && access.length() < QUEUE_SIZE {
                        let executed = Arc::clone(&executed);
                        if access
                            .try_move_in(Box::new(move || {
                                executed.fetch_add(1, Ordering::SeqCst);
                                false
                            }))
                            .is_err()
                        {
                            break;
                        }
                        added += 1;
                    }
                    if added > 0 {
                        queue.notify(u32::try_from(added).unwrap_or(1));
                    }
                }
                info!(timer = n, added, "timer expired");
            })
        })
        .collect();

    for (n, timer) in timers.iter().enumerate() {
        // Spread the timers over the short end of the interval table.
        timer.start_on(IntervalIndex(u8::try_from(n).unwrap_or(0) + 1), [high, mid, low][n % 3]);
    }

    std::thread::sleep(Duration::from_millis(args.run_millis));
    for timer in &timers {
        timer.stop();
        timer.wait_for_possible_expire_to_finish();
    }

    println!(
        "{} timers fired, {} pool items executed",
        fired.load(Ordering::SeqCst),
        executed.load(Ordering::SeqCst)
    );
    Ok(())
}
