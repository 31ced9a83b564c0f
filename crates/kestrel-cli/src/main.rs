use anyhow::{anyhow, bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kestrel_hal::{AddressSpace, Protection, VirtAddr};
use kestrel_kernel::error::Errno;
use kestrel_kernel::sync::syscalls::{opcode, SemaphoreBlock, SemaphoreWaitArgs, WAIT_PENDING};
use kestrel_kernel::sync::{Mutex, MutexKind, RwLock, RwState};
use kestrel_kernel::syscall::{group, Syscall, SyscallContext, SyscallNumber};
use kestrel_kernel::thread::tcb::ThreadControlBlock;
use kestrel_kernel::types::ThreadHandle;
use kestrel_kernel::{Kernel, KernelConfig};
use log::{debug, info};
use rand::Rng;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::{self, ScopedJoinHandle};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "kestrel", author, version, about = "Stress the Kestrel lock primitives", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy, Debug)]
struct Load {
    /// Number of contending threads
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Critical sections per thread
    #[arg(long, default_value_t = 10_000)]
    iterations: usize,

    /// Upper bound of busy-work spins inside a critical section
    #[arg(long, default_value_t = 64)]
    hold_spins: u32,
}

#[derive(Subcommand)]
enum Commands {
    /// Contend on one kernel mutex
    Mutex {
        #[command(flatten)]
        load: Load,

        #[arg(long, value_enum, default_value_t = Kind::Spin)]
        kind: Kind,
    },
    /// Mix readers and writers on one readers-writer lock
    Rwlock {
        #[command(flatten)]
        load: Load,

        /// Share of operations that take the write lock, in percent
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u8).range(0..=100))]
        write_percent: u8,
    },
    /// Wait on and release a user semaphore through the locks syscall group
    Semaphore {
        #[command(flatten)]
        load: Load,

        /// Semaphore capacity
        #[arg(long, default_value_t = 2)]
        count: u32,

        /// Timeout of each wait in milliseconds
        #[arg(long, default_value_t = 50)]
        timeout_ms: u32,

        /// Size of the kernel timer pool
        #[arg(long, default_value_t = 16)]
        max_timers: usize,

        /// Timer interrupt period in milliseconds
        #[arg(long, default_value_t = 10)]
        tick_ms: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    /// Busy-spin waiters
    Spin,
    /// Waiters yield the processor
    Yield,
}

impl From<Kind> for MutexKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Spin => MutexKind::Spin,
            Kind::Yield => MutexKind::Default,
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Mutex { load, kind } => run_mutex(load, kind.into()),
        Commands::Rwlock {
            load,
            write_percent,
        } => run_rwlock(load, write_percent),
        Commands::Semaphore {
            load,
            count,
            timeout_ms,
            max_timers,
            tick_ms,
        } => run_semaphore(
            load,
            count,
            timeout_ms,
            KernelConfig {
                max_timers,
                tick_ms,
            },
        ),
    }
}

fn hold(rng: &mut impl Rng, max_spins: u32) {
    for _ in 0..rng.gen_range(0..=max_spins) {
        hint::spin_loop();
    }
}

fn join_all<T>(handles: Vec<ScopedJoinHandle<'_, Result<T>>>) -> Result<Vec<T>> {
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        let result = handle
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))?;
        results.push(result?);
    }
    Ok(results)
}

fn run_mutex(load: Load, kind: MutexKind) -> Result<()> {
    ensure!(load.threads > 0, "--threads must be at least 1");
    info!("mutex stress: {:?} with {:?}", kind, load);

    let mutex = Mutex::with_tag(kind, "stress");
    let inside = AtomicUsize::new(0);
    let overlaps = AtomicUsize::new(0);
    let total = AtomicUsize::new(0);
    let barrier = Barrier::new(load.threads);
    let start = Instant::now();

    thread::scope(|s| {
        let handles = (0..load.threads)
            .map(|_| {
                s.spawn(|| -> Result<()> {
                    let mut rng = rand::thread_rng();
                    barrier.wait();
                    for _ in 0..load.iterations {
                        mutex.spin_acquire()?;
                        if inside.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        // Unsynchronized increment, only correct under the lock.
                        let seen = total.load(Ordering::Relaxed);
                        hold(&mut rng, load.hold_spins);
                        total.store(seen + 1, Ordering::Relaxed);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        mutex.release();
                    }
                    Ok(())
                })
            })
            .collect();
        join_all(handles)
    })?;

    let expected = load.threads * load.iterations;
    let total = total.load(Ordering::SeqCst);
    println!(
        "mutex ({:?}): {} critical sections in {:.2?}",
        kind,
        total,
        start.elapsed()
    );
    ensure!(
        overlaps.load(Ordering::SeqCst) == 0,
        "{} overlapping critical sections",
        overlaps.load(Ordering::SeqCst)
    );
    ensure!(total == expected, "lost updates: {} of {}", total, expected);
    ensure!(!mutex.is_held(), "mutex still held after all threads finished");
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
struct RwStats {
    reads: usize,
    writes: usize,
}

fn run_rwlock(load: Load, write_percent: u8) -> Result<()> {
    ensure!(load.threads > 0, "--threads must be at least 1");
    info!("rwlock stress: {}% writes with {:?}", write_percent, load);

    let lock = RwLock::new();
    let readers_in = AtomicUsize::new(0);
    let writers_in = AtomicUsize::new(0);
    let violations = AtomicUsize::new(0);
    let barrier = Barrier::new(load.threads);
    let start = Instant::now();

    let stats = thread::scope(|s| {
        let handles = (0..load.threads)
            .map(|_| {
                s.spawn(|| -> Result<RwStats> {
                    let mut rng = rand::thread_rng();
                    let mut stats = RwStats::default();
                    barrier.wait();
                    for _ in 0..load.iterations {
                        if rng.gen_range(0..100) < write_percent {
                            lock.write_lock();
                            if writers_in.fetch_add(1, Ordering::SeqCst) != 0
                                || readers_in.load(Ordering::SeqCst) != 0
                            {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            hold(&mut rng, load.hold_spins);
                            writers_in.fetch_sub(1, Ordering::SeqCst);
                            lock.write_unlock();
                            stats.writes += 1;
                        } else {
                            lock.read_lock();
                            readers_in.fetch_add(1, Ordering::SeqCst);
                            if writers_in.load(Ordering::SeqCst) != 0 {
                                violations.fetch_add(1, Ordering::SeqCst);
                            }
                            hold(&mut rng, load.hold_spins);
                            readers_in.fetch_sub(1, Ordering::SeqCst);
                            lock.read_unlock();
                            stats.reads += 1;
                        }
                    }
                    Ok(stats)
                })
            })
            .collect();
        join_all(handles)
    })?;

    let total = stats.iter().fold(RwStats::default(), |acc, s| RwStats {
        reads: acc.reads + s.reads,
        writes: acc.writes + s.writes,
    });
    println!(
        "rwlock: {} reads, {} writes in {:.2?}",
        total.reads,
        total.writes,
        start.elapsed()
    );
    ensure!(
        violations.load(Ordering::SeqCst) == 0,
        "{} reader/writer overlaps",
        violations.load(Ordering::SeqCst)
    );
    ensure!(
        lock.state() == RwState::Free && lock.writers_waiting() == 0,
        "lock left in {:?} with {} writers waiting",
        lock.state(),
        lock.writers_waiting()
    );
    Ok(())
}

const SEMAPHORE: u32 = 0x1000;
const WAIT_ARGS: u32 = SEMAPHORE + 0x10;

#[derive(Debug, Default, Clone, Copy)]
struct WaitStats {
    acquired: usize,
    retries: usize,
    timeouts: usize,
    exhausted: usize,
}

fn locks_call(kernel: &Kernel, thread: &mut ThreadControlBlock, op: u32, arg: u32) -> u32 {
    let mut ctx = SyscallContext::new(thread, kernel.timers());
    let call = Syscall::new(SyscallNumber::new(group::LOCKS, op), VirtAddr::new(arg));
    kernel.syscalls().dispatch(&mut ctx, call).value
}

fn run_semaphore(load: Load, count: u32, timeout_ms: u32, config: KernelConfig) -> Result<()> {
    ensure!(load.threads > 0, "--threads must be at least 1");
    ensure!(count > 0, "--count must be at least 1");
    info!(
        "semaphore stress: capacity {}, {} ms timeout, {:?}, {:?}",
        count, timeout_ms, config, load
    );

    let kernel = Kernel::new(config).context("kernel setup failed")?;

    let mut space = AddressSpace::new();
    let len = u32::try_from(0x10 + load.threads * 8).context("too many threads")?;
    space
        .map(
            VirtAddr::new(SEMAPHORE),
            len,
            Protection::READ | Protection::WRITE,
        )
        .context("mapping the semaphore page")?;
    space.write_pod(VirtAddr::new(SEMAPHORE), &SemaphoreBlock { s: count, count })?;
    let space = Arc::new(space);

    let inside = AtomicUsize::new(0);
    let overlaps = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);
    let barrier = Barrier::new(load.threads);
    let start = Instant::now();

    let stats = thread::scope(|s| {
        let (kernel, stop) = (&kernel, &stop);
        let ticker = s.spawn(move || {
            let period = Duration::from_millis(kernel.config().tick_ms as u64);
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(period);
                kernel.tick();
            }
        });

        let handles = (0..load.threads)
            .map(|i| {
                let (space, inside, overlaps, barrier) = (&space, &inside, &overlaps, &barrier);
                s.spawn(move || -> Result<WaitStats> {
                    let handle = ThreadHandle::new(i as u32 + 1)
                        .ok_or_else(|| anyhow!("no handle for worker {}", i))?;
                    let mut tcb = ThreadControlBlock::new(handle, Arc::clone(space), VirtAddr::new(0), 0);
                    let args = WAIT_ARGS + i as u32 * 8;
                    space.write_pod(
                        VirtAddr::new(args),
                        &SemaphoreWaitArgs {
                            sem: SEMAPHORE,
                            millisec: timeout_ms,
                        },
                    )?;

                    let mut rng = rand::thread_rng();
                    let mut stats = WaitStats::default();
                    barrier.wait();
                    for _ in 0..load.iterations {
                        loop {
                            let value = locks_call(kernel, &mut tcb, opcode::SEMAPHORE_WAIT, args);
                            match tcb.errno {
                                Errno::None if value == WAIT_PENDING => {
                                    stats.retries += 1;
                                    thread::yield_now();
                                }
                                Errno::None => break,
                                Errno::TimedOut => stats.timeouts += 1,
                                Errno::ResourceExhausted => {
                                    stats.exhausted += 1;
                                    thread::yield_now();
                                }
                                other => bail!("{}: semaphore wait failed: {:?}", handle, other),
                            }
                        }
                        stats.acquired += 1;

                        if inside.fetch_add(1, Ordering::SeqCst) >= count as usize {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        hold(&mut rng, load.hold_spins);
                        inside.fetch_sub(1, Ordering::SeqCst);

                        locks_call(kernel, &mut tcb, opcode::SEMAPHORE_RELEASE, SEMAPHORE);
                        if tcb.errno.is_error() {
                            bail!("{}: semaphore release failed: {:?}", handle, tcb.errno);
                        }
                    }

                    ensure!(
                        tcb.wait_timer.is_none(),
                        "{} finished holding {:?}",
                        handle,
                        tcb.wait_timer
                    );
                    debug!("{}: {:?}", handle, stats);
                    Ok(stats)
                })
            })
            .collect();

        let stats = join_all(handles);
        stop.store(true, Ordering::SeqCst);
        ticker
            .join()
            .map_err(|_| anyhow!("timer thread panicked"))?;
        stats
    })?;

    let total = stats.iter().fold(WaitStats::default(), |acc, s| WaitStats {
        acquired: acc.acquired + s.acquired,
        retries: acc.retries + s.retries,
        timeouts: acc.timeouts + s.timeouts,
        exhausted: acc.exhausted + s.exhausted,
    });
    println!(
        "semaphore: {} acquisitions, {} retries, {} timeouts, {} timer shortages in {:.2?}",
        total.acquired,
        total.retries,
        total.timeouts,
        total.exhausted,
        start.elapsed()
    );

    let value = space.read_word(VirtAddr::new(SEMAPHORE))?;
    ensure!(
        overlaps.load(Ordering::SeqCst) == 0,
        "more than {} holders at once ({} times)",
        count,
        overlaps.load(Ordering::SeqCst)
    );
    ensure!(value == count, "semaphore ended at {} of {}", value, count);
    ensure!(
        kernel.timers().in_use() == 0,
        "{} timers leaked",
        kernel.timers().in_use()
    );
    Ok(())
}
