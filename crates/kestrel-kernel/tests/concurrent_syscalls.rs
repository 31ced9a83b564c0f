//! Many host threads driving one syscall table at once, the way several
//! harts would.

use kestrel_hal::{irq, AddressSpace, Protection, VirtAddr};
use kestrel_kernel::error::Errno;
use kestrel_kernel::sync::syscalls::{opcode, SemaphoreBlock, SemaphoreWaitArgs, WAIT_PENDING};
use kestrel_kernel::syscall::{group, Syscall, SyscallContext, SyscallNumber, SyscallTable};
use kestrel_kernel::thread::tcb::ThreadControlBlock;
use kestrel_kernel::timer::Timers;
use kestrel_kernel::types::ThreadHandle;
use kestrel_kernel::Kernel;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const BLOCK: u32 = 0x1000;
const LOCK: u32 = 0x1008;
const ARGS: u32 = 0x1100;

fn user_space() -> Arc<AddressSpace> {
    let mut space = AddressSpace::new();
    space
        .map(VirtAddr::new(0x1000), 0x1000, Protection::READ | Protection::WRITE)
        .unwrap();
    Arc::new(space)
}

fn thread_control_block(id: usize, space: &Arc<AddressSpace>) -> ThreadControlBlock {
    ThreadControlBlock::new(
        ThreadHandle::new(id as u32 + 1).unwrap(),
        Arc::clone(space),
        VirtAddr::new(0),
        0,
    )
}

fn locks_call(
    table: &SyscallTable,
    tcb: &mut ThreadControlBlock,
    timers: &Timers,
    op: u32,
    arg: u32,
) -> u32 {
    let mut ctx = SyscallContext::new(tcb, timers);
    let call = Syscall::new(SyscallNumber::new(group::LOCKS, op), VirtAddr::new(arg));
    table.dispatch(&mut ctx, call).value
}

#[test]
fn racing_test_and_set_has_one_winner() {
    const THREADS: usize = 8;
    let _ = env_logger::builder().is_test(true).try_init();

    let table = Kernel::standard_syscalls().unwrap().build();
    let timers = Timers::new(1);
    let space = user_space();
    let winners = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for i in 0..THREADS {
            let (table, timers, space, winners, barrier) =
                (&table, &timers, &space, &winners, &barrier);
            s.spawn(move || {
                let mut tcb = thread_control_block(i, space);
                barrier.wait();
                match locks_call(table, &mut tcb, timers, opcode::TEST_AND_SET, LOCK) {
                    0 => {
                        assert_eq!(tcb.errno, Errno::None);
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    2 => assert_eq!(tcb.errno, Errno::Busy),
                    other => panic!("unexpected test_and_set result {other}"),
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::SeqCst), 1);
}

#[test]
fn semaphore_waiters_stay_within_capacity_and_free_their_timers() {
    const THREADS: usize = 6;
    const ITERATIONS: usize = 200;
    const COUNT: u32 = 2;
    let _ = env_logger::builder().is_test(true).try_init();

    let table = Kernel::standard_syscalls().unwrap().build();
    let timers = Timers::new(THREADS);
    let space = user_space();
    space
        .write_pod(
            VirtAddr::new(BLOCK),
            &SemaphoreBlock {
                s: COUNT,
                count: COUNT,
            },
        )
        .unwrap();

    let inside = AtomicU32::new(0);
    let timeouts = AtomicUsize::new(0);
    let stop = AtomicBool::new(false);

    thread::scope(|s| {
        let ticker = s.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                {
                    let _handler = irq::enter_handler();
                    timers.advance(1);
                }
                thread::yield_now();
            }
        });

        let workers: Vec<_> = (0..THREADS)
            .map(|i| {
                let (table, timers, space, inside, timeouts) =
                    (&table, &timers, &space, &inside, &timeouts);
                s.spawn(move || {
                    let mut tcb = thread_control_block(i, space);
                    let args = ARGS + i as u32 * 8;
                    space
                        .write_pod(
                            VirtAddr::new(args),
                            &SemaphoreWaitArgs {
                                sem: BLOCK,
                                millisec: 5,
                            },
                        )
                        .unwrap();

                    for _ in 0..ITERATIONS {
                        loop {
                            let value =
                                locks_call(table, &mut tcb, timers, opcode::SEMAPHORE_WAIT, args);
                            match tcb.errno {
                                Errno::None if value == WAIT_PENDING => thread::yield_now(),
                                Errno::None => {
                                    assert!(value < COUNT);
                                    break;
                                }
                                Errno::TimedOut => {
                                    assert_eq!(tcb.wait_timer, None);
                                    timeouts.fetch_add(1, Ordering::Relaxed);
                                }
                                other => panic!("unexpected errno {other:?}"),
                            }
                        }

                        assert!(inside.fetch_add(1, Ordering::SeqCst) < COUNT);
                        thread::yield_now();
                        inside.fetch_sub(1, Ordering::SeqCst);

                        assert_eq!(
                            locks_call(table, &mut tcb, timers, opcode::SEMAPHORE_RELEASE, BLOCK),
                            0
                        );
                        assert_eq!(tcb.errno, Errno::None);
                        assert!(space.read_word(VirtAddr::new(BLOCK)).unwrap() <= COUNT);
                    }
                    assert_eq!(tcb.wait_timer, None);
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        stop.store(true, Ordering::SeqCst);
        ticker.join().unwrap();
    });

    log::info!("{} waits timed out", timeouts.load(Ordering::Relaxed));
    assert_eq!(space.read_word(VirtAddr::new(BLOCK)).unwrap(), COUNT);
    assert_eq!(timers.in_use(), 0);
}
