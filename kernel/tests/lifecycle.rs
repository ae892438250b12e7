mod common;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use common::{boot_cpus, settle, Recorder, CHILD, DATA, MAIN, TIMEOUT};
use kernel::{
    mm::layout::KERNBASE, process::context::TrapFrame, Image, KernelConfig, PageFlags, Pid,
    VirtAddr,
};

const WAITER: VirtAddr = VirtAddr::new(0x80_0200);

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Forked(Pid),
    ChildRan(Pid),
    Waited(bool),
    WaitedAgain(bool),
}

fn fork_wait_exit_image(recorder: &Recorder<Event>) -> Image {
    let parent = recorder.clone();
    let child = recorder.clone();
    Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let b = ctx.fork(CHILD).expect("fork");
            parent.push(Event::Forked(b));
            parent.push(Event::Waited(ctx.wait(b)));
            // b is a zombie now, this wait reclaims it first
            parent.push(Event::WaitedAgain(ctx.wait(b)));
        })
        .routine(CHILD, move |ctx| {
            child.push(Event::ChildRan(ctx.getpid()));
            ctx.exit();
        })
}

#[test]
fn fork_wait_exit_on_one_core() {
    let recorder = Recorder::new();
    let machine = boot_cpus(1, &fork_wait_exit_image(&recorder));
    settle(&machine);

    let events = recorder.events();
    let Event::Forked(b) = events[0] else {
        panic!("unexpected {:?}", events);
    };
    assert_eq!(
        events,
        vec![
            Event::Forked(b),
            Event::ChildRan(b),
            Event::Waited(true),
            Event::WaitedAgain(false),
        ]
    );
    assert!(!machine.is_valid(b));
    let snapshot = machine.snapshot();
    assert_eq!(snapshot.live, vec![machine.init_pid()]);
    assert_eq!(snapshot.zombies, vec![machine.init_pid()]);
}

#[test]
fn parent_wait_succeeds_on_many_cores() {
    let recorder = Recorder::new();
    let parent = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let child = ctx.fork(CHILD).expect("fork");
            // the child serves us once, so the first wait cannot miss it
            parent.push(ctx.wait(child));
            while ctx.wait(child) {}
            parent.push(false);
        })
        .routine(CHILD, |ctx| {
            ctx.serve();
        });
    let machine = boot_cpus(4, &image);
    settle(&machine);
    assert_eq!(recorder.events(), vec![true, false]);
    assert_eq!(machine.snapshot().live, vec![machine.init_pid()]);
}

#[test]
fn child_sees_parent_frame_with_zero_return() {
    let recorder: Recorder<(String, TrapFrame)> = Recorder::new();
    let parent = recorder.clone();
    let child = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            ctx.modify_trap_frame(|tf| {
                tf.rbx = 0x1234;
                tf.rbp = 0x5678;
                tf.rcx = 42;
            });
            let before = ctx.trap_frame();
            let pid = ctx.fork(CHILD).expect("fork");
            parent.push(("before".into(), before));
            parent.push(("after".into(), ctx.trap_frame()));
            assert_ne!(pid.as_raw(), 0);
            ctx.wait(pid);
        })
        .routine(CHILD, move |ctx| {
            child.push(("child".into(), ctx.trap_frame()));
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);

    let events = recorder.events();
    let frame = |name: &str| {
        events
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, tf)| tf.clone())
            .expect(name)
    };
    let before = frame("before");
    let after = frame("after");
    let child = frame("child");

    let mut expected = before.clone();
    expected.rip = CHILD.as_usize() as u64;
    expected.rax = 0;
    expected.rdi = 0;
    expected.rsi = 0;
    assert_eq!(child, expected);
    assert_eq!(child.rbx, 0x1234);
    assert_eq!(child.rsp, kernel::mm::layout::USTACKTOP as u64);
    // the parent got the child id back and kept running
    assert_ne!(after.rax, 0);
    assert_eq!(after.rbp, before.rbp);
    assert_eq!(after.rip, before.rip);
}

#[test]
fn fork_copies_memory() {
    let recorder = Recorder::new();
    let parent = recorder.clone();
    let child = recorder.clone();
    let image = Image::new(MAIN)
        .segment(DATA, b"", 64, PageFlags::READABLE | PageFlags::WRITABLE)
        .routine(MAIN, move |ctx| {
            assert!(ctx.write(DATA, b"parent"));
            let pid = ctx.fork(CHILD).expect("fork");
            assert!(ctx.wait(pid));
            parent.push(ctx.read(DATA, 6).unwrap());
        })
        .routine(CHILD, move |ctx| {
            child.push(ctx.read(DATA, 6).unwrap());
            assert!(ctx.write(DATA, b"child!"));
            child.push(ctx.read(DATA, 6).unwrap());
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);
    assert_eq!(
        recorder.events(),
        vec![b"parent".to_vec(), b"child!".to_vec(), b"parent".to_vec()]
    );
}

#[test]
fn read_only_text_rejects_writes() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN)
        .segment(DATA, b"code", 4, PageFlags::READABLE | PageFlags::EXECUTABLE)
        .routine(MAIN, move |ctx| {
            seen.push(ctx.write(DATA, b"xxxx"));
            seen.push(ctx.read(DATA, 4) == Some(b"code".to_vec()));
            seen.push(ctx.read(VirtAddr::new(0x10), 1).is_none());
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);
    assert_eq!(recorder.events(), vec![false, true, true]);
}

#[test]
fn out_of_range_user_access_fails_quietly() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN)
        .segment(DATA, b"", 64, PageFlags::READABLE | PageFlags::WRITABLE)
        .routine(MAIN, move |ctx| {
            seen.push(ctx.write(VirtAddr::new(usize::MAX - 1), &[0u8; 4]));
            seen.push(ctx.write(VirtAddr::new(KERNBASE - 2), &[0u8; 4]));
            seen.push(ctx.read(VirtAddr::new(usize::MAX - 1), 4).is_some());
            seen.push(ctx.read(DATA, usize::MAX).is_some());
            // the process is still usable afterwards
            seen.push(ctx.write(DATA, b"ok"));
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);
    assert_eq!(recorder.events(), vec![false, false, false, false, true]);
    assert!(!machine.kernel().is_halted());
}

#[test]
fn exit_releases_every_waiter() {
    let recorder = Recorder::new();
    let init = recorder.clone();
    let waiters = recorder.clone();
    let exiting: Recorder<Pid> = Recorder::new();
    let announce = exiting.clone();
    let release = Arc::new(AtomicBool::new(false));
    let released = release.clone();

    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let p = ctx.fork(CHILD).expect("fork");
            init.push(("init", ctx.wait(p)));
            // p is a zombie now, this wait reclaims it
            init.push(("init again", ctx.wait(p)));
        })
        .routine(CHILD, move |ctx| {
            let me = ctx.getpid();
            announce.push(me);
            ctx.modify_trap_frame(|tf| tf.rbx = me.as_raw());
            for _ in 0..3 {
                ctx.fork(WAITER).expect("fork");
            }
            while !released.load(Ordering::Acquire) {
                ctx.yield_now();
            }
            ctx.exit();
        })
        .routine(WAITER, move |ctx| {
            let target = Pid::from_raw(ctx.trap_frame().rbx);
            waiters.push(("waiter", ctx.wait(target)));
        });
    let machine = boot_cpus(2, &image);

    // hold the exit back until init and all three children wait on it
    assert!(machine.wait_until(TIMEOUT, |m| {
        let Some(&p) = exiting.events().first() else {
            return false;
        };
        m.snapshot()
            .waiters
            .iter()
            .any(|(target, queue)| *target == p && queue.len() == 4)
    }));
    release.store(true, Ordering::Release);
    settle(&machine);

    let p = exiting.events()[0];
    let events = recorder.events();
    assert_eq!(events.iter().filter(|e| **e == ("waiter", true)).count(), 3);
    assert!(events.contains(&("init", true)));
    assert!(events.contains(&("init again", false)));
    assert_eq!(events.len(), 5);
    assert!(!machine.is_valid(p));
}

#[test]
fn wait_on_invalid_target_fails_without_blocking() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN).routine(MAIN, move |ctx| {
        let me = ctx.getpid();
        seen.push(ctx.wait(Pid::from_raw(0xdead_0000_0007)));
        seen.push(ctx.wait(me));
        seen.push(ctx.wait(Pid::from_raw(0)));
    });
    let machine = boot_cpus(1, &image);
    settle(&machine);
    assert_eq!(recorder.events(), vec![false, false, false]);
    let snapshot = machine.snapshot();
    assert!(snapshot.waiters.is_empty());
    assert_eq!(snapshot.live, vec![machine.init_pid()]);
}

#[test]
fn any_wait_reclaims_all_zombies() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let z1 = ctx.fork(CHILD).expect("fork");
            let z2 = ctx.fork(CHILD).expect("fork");
            seen.push(z1);
            seen.push(z2);
            // both children run and exit before we are dispatched again
            ctx.yield_now();
            assert!(!ctx.wait(Pid::from_raw(u64::MAX - 1)));
        })
        .routine(CHILD, |_| {});
    let machine = boot_cpus(1, &image);
    settle(&machine);
    let zombies = recorder.events();
    assert_eq!(zombies.len(), 2);
    for zombie in zombies {
        assert!(!machine.is_valid(zombie));
    }
    assert_eq!(machine.snapshot().zombies, vec![machine.init_pid()]);
}

#[test]
fn missing_code_exits_the_process() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN).routine(MAIN, move |ctx| {
        // nothing is installed at this address
        let child = ctx.fork(VirtAddr::new(0x70_0000)).expect("fork");
        seen.push((child, ctx.wait(child)));
    });
    let machine = boot_cpus(1, &image);
    settle(&machine);
    let events = recorder.events();
    let (child, waited) = events[0];
    assert!(waited);
    assert_eq!(machine.snapshot().zombies, vec![child, machine.init_pid()]);
}

#[test]
fn fork_reports_exhausted_memory() {
    let recorder = Recorder::new();
    let seen = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let mut forked = 0;
            while ctx.fork(CHILD).is_some() {
                forked += 1;
            }
            seen.push(forked);
            // the machine keeps working after a failed fork
            seen.push(ctx.getpid().as_raw());
        })
        .routine(CHILD, |_| {});
    let config = KernelConfig {
        ncpu: 1,
        memory_size: 64 * 4096,
        ..KernelConfig::default()
    };
    let machine = kernel::boot(config, &image).expect("boot");
    settle(&machine);
    let events = recorder.events();
    assert!(events[0] >= 1, "forked {}", events[0]);
    assert_eq!(events[1], machine.init_pid().as_raw());
}

#[test]
fn user_fault_halts_the_machine() {
    let image = Image::new(MAIN).routine(MAIN, |_| panic!("user fault"));
    let machine = boot_cpus(2, &image);
    // the fault is recorded once every core has been halted
    assert!(machine.wait_until(TIMEOUT, |m| m.fault().is_some()));
    assert!(machine.fault().unwrap().contains("user fault"));
    assert!(machine.kernel().is_halted());
    for cpu in 0..2 {
        assert_eq!(machine.cpu_status(cpu), kernel::cpu::CpuStatus::Halted);
    }
}
