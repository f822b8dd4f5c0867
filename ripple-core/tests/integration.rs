//! Integration Tests for the Reactive Engine
//!
//! These tests drive the public API end to end: cells, computeds, watchers,
//! render bindings, reactive containers and the differ working together.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use ripple_core::{
    DiffAction, Freshness, Raw, ReactiveError, Runtime, Value, WatchOptions, WatchSource,
};

fn counter() -> Rc<Cell<usize>> {
    Rc::new(Cell::new(0))
}

fn bump(count: &Cell<usize>) {
    count.set(count.get() + 1);
}

/// A diamond (a -> b, a -> c, b + c -> d) recomputes the bottom once per write.
#[test]
fn diamond_recomputes_once() {
    let rt = Runtime::new();
    let a = rt.signal(1);
    let b = {
        let a = a.clone();
        rt.computed(move |_| a.get() + 1)
    };
    let c = {
        let a = a.clone();
        rt.computed(move |_| a.get() * 2)
    };
    let d_runs = counter();
    let d = {
        let (b, c, d_runs) = (b.clone(), c.clone(), d_runs.clone());
        rt.computed(move |_| {
            bump(&d_runs);
            b.get() + c.get()
        })
    };

    let seen = Rc::new(RefCell::new(Vec::new()));
    let _effect = {
        let (d, seen) = (d.clone(), seen.clone());
        rt.watch_effect(move || seen.borrow_mut().push(d.get()))
    };
    assert_eq!(*seen.borrow(), vec![4]);
    assert_eq!(d_runs.get(), 1);

    a.set(2);
    assert_eq!(*seen.borrow(), vec![4, 7]);
    assert_eq!(d_runs.get(), 2);

    a.set(3);
    assert_eq!(*seen.borrow(), vec![4, 7, 10]);
    assert_eq!(d_runs.get(), 3);
}

/// A read that stops happening also stops subscribing.
#[test]
fn branch_flip_drops_stale_subscriptions() {
    let rt = Runtime::new();
    let flag = rt.signal(true);
    let left = rt.signal("left");
    let right = rt.signal("right");
    let runs = counter();

    let _effect = {
        let (flag, left, right, runs) = (flag.clone(), left.clone(), right.clone(), runs.clone());
        rt.watch_effect(move || {
            bump(&runs);
            let _ = if flag.get() { left.get() } else { right.get() };
        })
    };
    assert_eq!(runs.get(), 1);
    assert_eq!(left.subscriber_count(), 1);
    assert_eq!(right.subscriber_count(), 0);

    flag.set(false);
    assert_eq!(runs.get(), 2);
    assert_eq!(left.subscriber_count(), 0);
    assert_eq!(right.subscriber_count(), 1);

    left.set("ignored");
    assert_eq!(runs.get(), 2);

    right.set("seen");
    assert_eq!(runs.get(), 3);
}

/// Writing the value a slot already holds notifies nobody.
#[test]
fn identity_writes_are_silent() {
    let rt = Runtime::new();
    let state = rt.reactive(Raw::object([("name", "a")]));
    let cell = rt.signal(5);
    let runs = counter();

    let _effect = {
        let (state, cell, runs) = (state.clone(), cell.clone(), runs.clone());
        rt.watch_effect(move || {
            bump(&runs);
            let _ = state.get("name");
            let _ = cell.get();
        })
    };
    assert_eq!(runs.get(), 1);

    state.set("name", "a").unwrap();
    cell.set(5);
    assert_eq!(runs.get(), 1);

    let r = rt.new_ref(f64::NAN);
    let ref_runs = counter();
    let _ref_effect = {
        let (r, ref_runs) = (r.clone(), ref_runs.clone());
        rt.watch_effect(move || {
            bump(&ref_runs);
            let _ = r.get();
        })
    };
    r.set(f64::NAN).unwrap();
    assert_eq!(ref_runs.get(), 1);
}

/// Several writes inside a batch produce one re-run.
#[test]
fn batch_coalesces_writes() {
    let rt = Runtime::new();
    let state = rt.reactive(Raw::object([("x", 0), ("y", 0)]));
    let sums = Rc::new(RefCell::new(Vec::new()));

    let _effect = {
        let (state, sums) = (state.clone(), sums.clone());
        rt.watch_effect(move || {
            let x = state.get("x").ok().and_then(|v| v.as_f64()).unwrap_or(0.0);
            let y = state.get("y").ok().and_then(|v| v.as_f64()).unwrap_or(0.0);
            sums.borrow_mut().push(x + y);
        })
    };

    rt.batch(|| {
        state.set("x", 1).unwrap();
        state.set("y", 2).unwrap();
        state.set("x", 3).unwrap();
        assert_eq!(rt.pending_jobs(), 1);
    });
    assert_eq!(*sums.borrow(), vec![0.0, 5.0]);
    assert_eq!(rt.pending_jobs(), 0);
}

/// A computed whose value did not change does not wake its readers.
#[test]
fn unchanged_computed_does_not_notify() {
    let rt = Runtime::new();
    let x = rt.signal(2);
    let parity_runs = counter();
    let parity = {
        let (x, parity_runs) = (x.clone(), parity_runs.clone());
        rt.computed(move |_| {
            bump(&parity_runs);
            x.get() % 2
        })
    };
    let effect_runs = counter();
    let _effect = {
        let (parity, effect_runs) = (parity.clone(), effect_runs.clone());
        rt.watch_effect(move || {
            bump(&effect_runs);
            let _ = parity.get();
        })
    };
    assert_eq!((parity_runs.get(), effect_runs.get()), (1, 1));

    x.set(4);
    assert_eq!((parity_runs.get(), effect_runs.get()), (2, 1));

    x.set(5);
    assert_eq!((parity_runs.get(), effect_runs.get()), (3, 2));
}

/// A computed with no readers is not evaluated until read.
#[test]
fn computed_is_lazy() {
    let rt = Runtime::new();
    let x = rt.signal(1);
    let runs = counter();
    let double = {
        let (x, runs) = (x.clone(), runs.clone());
        rt.computed(move |_| {
            bump(&runs);
            x.get() * 2
        })
    };
    assert_eq!(runs.get(), 0);

    x.set(2);
    x.set(3);
    assert_eq!(runs.get(), 0);

    assert_eq!(double.get(), 6);
    assert_eq!(double.get(), 6);
    assert_eq!(runs.get(), 1);
}

/// State, a computed over it and a watcher on the computed.
#[test]
fn container_computed_watch_chain() {
    let rt = Runtime::new();
    let state = rt.reactive(Raw::object([("count", 0)]));
    let double = {
        let state = state.clone();
        rt.computed(move |_| {
            state
                .get("count")
                .ok()
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0)
                * 2.0
        })
    };

    let calls = Rc::new(RefCell::new(Vec::new()));
    let handle = {
        let calls = calls.clone();
        rt.watch(
            &double,
            move |new: &f64, old: Option<&f64>| calls.borrow_mut().push((*new, old.copied())),
            WatchOptions::default(),
        )
    };

    state.set("count", 5).unwrap();
    assert_eq!(*calls.borrow(), vec![(10.0, Some(0.0))]);

    handle.stop();
    state.set("count", 6).unwrap();
    assert_eq!(calls.borrow().len(), 1);
    assert_eq!(double.get(), 12.0);
}

/// Deep watchers see writes into nested containers.
#[test]
fn deep_watch_sees_nested_writes() {
    let rt = Runtime::new();
    let state = rt.reactive(Raw::object([(
        "user",
        Value::object([("name", "ada")]),
    )]));
    let fired = counter();
    let _handle = {
        let fired = fired.clone();
        rt.watch(
            &state,
            move |_: &Value, _: Option<&Value>| bump(&fired),
            WatchOptions::default(),
        )
    };

    let user = state.get("user").unwrap();
    let Some(user) = user.as_proxy() else {
        panic!("nested containers come back wrapped");
    };
    user.set("name", "grace").unwrap();
    assert_eq!(fired.get(), 1);
}

/// Independent runtimes never see each other's reads.
#[test]
fn runtimes_are_isolated() {
    let first = Runtime::new();
    let second = Runtime::new();
    let foreign = first.signal(1);
    let runs = counter();

    let _effect = {
        let (foreign, runs) = (foreign.clone(), runs.clone());
        second.watch_effect(move || {
            bump(&runs);
            let _ = foreign.get();
        })
    };
    assert_eq!(foreign.subscriber_count(), 0);

    foreign.set(2);
    assert_eq!(runs.get(), 1);
    assert!(!first.ptr_eq(&second));
}

/// Watchers settle before any render binding is told it is dirty.
#[test]
fn render_lane_runs_after_watchers() {
    let rt = Runtime::new();
    let source = rt.signal(0);
    let log = Rc::new(RefCell::new(Vec::new()));

    let render = {
        let (source, log) = (source.clone(), log.clone());
        let on_dirty_log = log.clone();
        rt.bind_render(
            move || {
                let _ = source.get();
                log.borrow_mut().push("render");
            },
            move || on_dirty_log.borrow_mut().push("dirty"),
        )
    };
    let _watch = {
        let (source, log) = (source.clone(), log.clone());
        rt.watch_effect(move || {
            let _ = source.get();
            log.borrow_mut().push("watch");
        })
    };
    log.borrow_mut().clear();

    source.set(1);
    assert_eq!(*log.borrow(), vec!["watch", "dirty"]);

    render.run();
    assert_eq!(*log.borrow(), vec!["watch", "dirty", "render"]);
    render.stop();
    source.set(2);
    assert_eq!(log.borrow().last(), Some(&"watch"));
}

/// Two watchers feeding each other give up after the recursion limit.
#[test]
fn runaway_updates_hit_the_recursion_limit() {
    let rt = Runtime::builder().recursion_limit(10).build();
    let a = rt.signal(0);
    let b = rt.signal(0);
    let runs = counter();

    let _forward = {
        let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
        rt.watch_effect(move || {
            bump(&runs);
            let next = a.get() + 1;
            b.set(next);
        })
    };
    let _backward = {
        let (a, b, runs) = (a.clone(), b.clone(), runs.clone());
        rt.watch_effect(move || {
            bump(&runs);
            let next = b.get() + 1;
            a.set(next);
        })
    };

    let before = runs.get();
    a.set(100);
    let during = runs.get() - before;
    assert!(during <= 2 * 10 + 2, "ran {during} times");
    assert_eq!(rt.pending_jobs(), 0);
}

/// Reads made while suspended are not attributed to the running context.
#[test]
fn suspended_reads_are_untracked() {
    let rt = Runtime::new();
    let tracked = rt.signal(0);
    let hidden = rt.signal(0);
    let runs = counter();

    let _effect = {
        let (tracked, hidden, runs) = (tracked.clone(), hidden.clone(), runs.clone());
        rt.watch_effect(move || {
            bump(&runs);
            let _ = tracked.get();
            let _suspended = hidden.runtime().suspend();
            let _ = hidden.get();
        })
    };

    hidden.set(1);
    assert_eq!(runs.get(), 1);
    tracked.set(1);
    assert_eq!(runs.get(), 2);
}

/// Watching several sources at once.
#[test]
fn watch_many_sources() {
    let rt = Runtime::new();
    let a = rt.signal(1);
    let b = rt.signal(2);
    let calls = Rc::new(RefCell::new(Vec::new()));

    let _handle = {
        let calls = calls.clone();
        rt.watch(
            WatchSource::many([WatchSource::from(&a), WatchSource::from(&b)]),
            move |new: &Vec<i32>, _: Option<&Vec<i32>>| calls.borrow_mut().push(new.clone()),
            WatchOptions::new().immediate(true),
        )
    };
    rt.batch(|| {
        a.set(10);
        b.set(20);
    });
    assert_eq!(*calls.borrow(), vec![vec![1, 2], vec![10, 20]]);
}

/// The differ reports which list positions survived and which are stale.
#[test]
fn diff_tracks_list_edits() {
    let rt = Runtime::new();
    let (a, b, c) = (
        Value::object([("id", 1)]),
        Value::object([("id", 2)]),
        Value::object([("id", 3)]),
    );
    let old = Value::list([a.clone(), b.clone(), c.clone()]);
    let new = Value::list([a.clone(), c.clone(), b.clone(), Value::object([("id", 4)])]);

    let result = rt.diff(&old, &new);
    let inserted = result
        .ops
        .iter()
        .filter(|op| op.action == DiffAction::Insert)
        .count();
    let deleted = result
        .ops
        .iter()
        .filter(|op| op.action == DiffAction::Delete)
        .count();
    assert!(inserted >= 1);
    assert_eq!(result.ops.len(), result.states.len());
    assert_eq!(inserted - deleted, 1);
    assert!(result.old_to_new().contains(&(0, 0)));
    assert!(!result.is_only_nop);

    let same = rt.diff(&old, &Value::list([a, b, c]));
    assert!(same.is_only_nop);
    assert!(same.states.iter().all(|s| *s == Freshness::Fresh));
}

/// Read-only surfaces reject writes with a typed error.
#[test]
fn readonly_surfaces_reject_writes() {
    let rt = Runtime::new();
    let base = rt.signal(1);
    let derived = {
        let base = base.clone();
        rt.computed(move |_| base.get() + 1)
    };
    assert_eq!(derived.set(5), Err(ReactiveError::ReadonlyComputed));

    let getter = rt.getter_ref(|| 3);
    assert_eq!(getter.set(4), Err(ReactiveError::GetterRefReadonly));

    let writable = {
        let read = base.clone();
        let write = base.clone();
        rt.computed_with_setter(move |_| read.get() * 10, move |v| write.set(v / 10))
    };
    writable.set(70).unwrap();
    assert_eq!(base.get_untracked(), 7);
    assert_eq!(writable.get(), 70);
}
