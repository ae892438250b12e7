mod common;

use std::collections::BTreeMap;

use common::{boot_cpus, settle, Recorder, CHILD, MAIN, TIMEOUT};
use kernel::{Image, Pid, UserContext};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Forked(Pid),
    Served(Pid),
    Released(Pid, bool),
}

/// Forks `n` children running CHILD. Each child finds the parent pid in
/// `rbx` and its own index in `rcx`.
fn fork_children(ctx: &mut UserContext, n: u64) -> Vec<Pid> {
    let me = ctx.getpid();
    (0..n)
        .map(|index| {
            ctx.modify_trap_frame(|tf| {
                tf.rbx = me.as_raw();
                tf.rcx = index;
            });
            ctx.fork(CHILD).expect("fork")
        })
        .collect()
}

#[test]
fn server_handles_clients_in_wait_order() {
    let recorder = Recorder::new();
    let server = recorder.clone();
    let client = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            for pid in fork_children(ctx, 2) {
                server.push(Event::Forked(pid));
            }
            let first = ctx.serve();
            server.push(Event::Served(first));
            let second = ctx.serve();
            server.push(Event::Served(second));
        })
        .routine(CHILD, move |ctx| {
            let server = Pid::from_raw(ctx.trap_frame().rbx);
            let me = ctx.getpid();
            let served = ctx.wait(server);
            client.push(Event::Released(me, served));
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);

    let events = recorder.events();
    let (w1, w2) = match events[..2] {
        [Event::Forked(w1), Event::Forked(w2)] => (w1, w2),
        _ => panic!("unexpected {:?}", events),
    };
    assert_eq!(&events[2..4], &[Event::Served(w1), Event::Served(w2)]);
    let mut released: Vec<_> = events[4..].to_vec();
    released.sort_by_key(|event| format!("{:?}", event));
    let mut expected = vec![Event::Released(w1, true), Event::Released(w2, true)];
    expected.sort_by_key(|event| format!("{:?}", event));
    assert_eq!(released, expected);
}

#[test]
fn every_waiter_is_served_once_on_many_cores() {
    const CLIENTS: u64 = 6;
    let recorder = Recorder::new();
    let server = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let children = fork_children(ctx, CLIENTS);
            let served: Vec<Pid> = (0..CLIENTS).map(|_| ctx.serve()).collect();
            server.push((children, served));
        })
        .routine(CHILD, |ctx| {
            let server = Pid::from_raw(ctx.trap_frame().rbx);
            assert!(ctx.wait(server));
        });
    let machine = boot_cpus(4, &image);
    settle(&machine);
    let (mut children, mut served) = recorder.events().remove(0);
    children.sort();
    served.sort();
    // every client is served exactly once
    assert_eq!(children, served);
}

#[test]
fn integer_messages_follow_send_order() {
    let recorder = Recorder::new();
    let server = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let children = fork_children(ctx, 3);
            for _ in 0..3 {
                let (sender, value) = ctx.recvi();
                server.push((sender, value));
            }
            server.push((ctx.getpid(), children.len() as u64));
            for (index, child) in children.into_iter().enumerate() {
                server.push((child, index as u64));
            }
        })
        .routine(CHILD, |ctx| {
            let server = Pid::from_raw(ctx.trap_frame().rbx);
            let index = ctx.trap_frame().rcx;
            assert!(ctx.sendi(server, 100 + index));
        });
    let machine = boot_cpus(1, &image);
    settle(&machine);

    let events = recorder.events();
    let received = &events[..3];
    let children = &events[4..];
    for (index, (sender, value)) in received.iter().enumerate() {
        assert_eq!(*sender, children[index].0);
        assert_eq!(*value, 100 + index as u64);
    }
}

#[test]
fn integer_messages_across_cores() {
    const CLIENTS: u64 = 8;
    let recorder = Recorder::new();
    let server = recorder.clone();
    let client = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            fork_children(ctx, CLIENTS);
            for _ in 0..CLIENTS {
                let (sender, value) = ctx.recvi();
                server.push(("recv", sender, value));
            }
        })
        .routine(CHILD, move |ctx| {
            let server = Pid::from_raw(ctx.trap_frame().rbx);
            let value = 1000 + ctx.trap_frame().rcx;
            client.push(("send", ctx.getpid(), value));
            assert!(ctx.sendi(server, value));
        });
    let machine = boot_cpus(4, &image);
    settle(&machine);

    let events = recorder.events();
    let collect = |kind: &str| -> BTreeMap<Pid, u64> {
        events
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|&(_, pid, value)| (pid, value))
            .collect()
    };
    let sent = collect("send");
    let received = collect("recv");
    assert_eq!(sent.len(), CLIENTS as usize);
    assert_eq!(sent, received);
}

#[test]
fn serve_polls_until_someone_waits() {
    let recorder = Recorder::new();
    let server = recorder.clone();
    let image = Image::new(MAIN)
        .routine(MAIN, move |ctx| {
            let me = ctx.getpid();
            ctx.modify_trap_frame(|tf| tf.rbx = me.as_raw());
            let child = ctx.fork(CHILD).expect("fork");
            server.push(ctx.serve() == child);
        })
        .routine(CHILD, |ctx| {
            // let the server spin a few rounds first
            for _ in 0..10 {
                ctx.yield_now();
            }
            let server = Pid::from_raw(ctx.trap_frame().rbx);
            assert!(ctx.wait(server));
        });
    let machine = boot_cpus(2, &image);
    assert!(machine.wait_until(TIMEOUT, |_| recorder.len() == 1));
    settle(&machine);
    assert_eq!(recorder.events(), vec![true]);
}
