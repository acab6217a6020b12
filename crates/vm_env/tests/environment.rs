mod common;

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{environment, listener, run_reactor, scripted, wait_until};
use vm_env::{EngineId, EngineState, Environment, OsError, SliceOutcome, VmError};
use vm_store::Value;

fn engine_id(source: &str) -> EngineId {
    EngineId(source.rsplit(' ').next().unwrap().parse().unwrap())
}

#[test]
fn test_live_count_follows_engines() {
    let env = environment(|_, _| Ok(listener()));
    let handles: Vec<_> = (0..3)
        .map(|i| env.add_engine(format!("listener {i}"), false).unwrap())
        .collect();
    assert_eq!(env.live_engines(), 3);
    assert_eq!(env.list_engines().len(), 3);

    env.request_termination(handles[1].id(), 0).unwrap();
    assert!(wait_until(|| env.live_engines() == 2));
    let list = env.list_engines();
    assert!(list.contains(handles[0].id()));
    assert!(!list.contains(handles[1].id()));

    for handle in &handles {
        handle.request_termination(0);
    }
    run_reactor(&env);
    assert_eq!(env.live_engines(), 0);
    assert_eq!(env.list_engines().len(), 0);
}

#[test]
fn test_kill_stops_reactor_with_exit_code() {
    let env = environment(|_, _| Ok(listener()));
    let handle = env.add_engine("main", false).unwrap();
    assert_eq!(env.live_engines(), 1);
    assert!(wait_until(|| handle.state() == EngineState::Waiting));

    env.request_termination(handle.id(), 7).unwrap();
    assert_eq!(run_reactor(&env), 7);
    assert_eq!(handle.state(), EngineState::Terminated);
    assert_eq!(env.live_engines(), 0);
    assert!(matches!(
        env.request_termination(handle.id(), 1),
        Err(VmError::UnknownEngine(_))
    ));
}

#[test]
fn test_voluntary_exit_code() {
    let env = environment(|_, _| Ok(scripted(|_, _| SliceOutcome::Exit(3))));
    env.add_engine("main", false).unwrap();
    assert_eq!(run_reactor(&env), 3);
}

#[test]
fn test_idle_engine_without_work_terminates() {
    let env = environment(|_, _| Ok(scripted(|_, _| SliceOutcome::Idle)));
    let handle = env.add_engine("main", false).unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(handle.exit_code(), Some(0));
}

#[test]
fn test_panicking_interpreter_is_contained() {
    let env = environment(|_, _| Ok(scripted(|_, _| panic!("interpreter bug"))));
    env.add_engine("main", false).unwrap();
    assert_eq!(run_reactor(&env), 1);
    assert_eq!(env.live_engines(), 0);
}

#[test]
fn test_panicking_entries_during_shutdown_are_contained() {
    let env = environment(|_, _| Ok(listener()));
    let handle = env.add_engine("main", false).unwrap();
    assert!(wait_until(|| handle.state() == EngineState::Waiting));

    handle.post(|_| panic!("first entry")).unwrap();
    handle.post(|_| panic!("second entry")).unwrap();
    assert_eq!(run_reactor(&env), 1);
    assert_eq!(env.live_engines(), 0);
    assert_eq!(handle.state(), EngineState::Terminated);
    assert_eq!(env.list_engines().len(), 0);
}

#[test]
fn test_stream_closed_before_first_read_keeps_messages() {
    let received = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&received);
    let env = environment(|_, _| Ok(listener()));
    let handle = env.add_engine("main", false).unwrap();
    handle
        .post(move |ctx| {
            ctx.receive(Value::Int(1)).unwrap();
            ctx.receive(Value::Int(2)).unwrap();
            ctx.close_stream().unwrap();
            ctx.collect_garbage(std::iter::empty());
            let stream = ctx.get_stream();
            *observed.lock().unwrap() = ctx.store().resolve(&stream).ok();
            ctx.request_termination(0);
        })
        .unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(
        received.lock().unwrap().take(),
        Some(Value::list(vec![Value::Int(1), Value::Int(2)]))
    );
}

#[test]
fn test_async_read_binds_placeholder() {
    let result = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&result);
    let env = environment(move |_, _| {
        let observed = Arc::clone(&observed);
        let mut placeholder: Option<Value> = None;
        Ok(scripted(move |ctx, _| {
            let Some(view) = placeholder.clone() else {
                placeholder = Some(ctx.spawn_io("read", async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok::<_, io::Error>(Value::Bytes(b"data".to_vec()))
                }));
                assert_eq!(ctx.pending_async(), 1);
                return SliceOutcome::Idle;
            };
            match ctx.store().deref(&view) {
                Ok(Value::Var(_) | Value::ReadOnly(_)) => SliceOutcome::Idle,
                Ok(value) => {
                    *observed.lock().unwrap() = Some((value.clone(), ctx.pending_async()));
                    SliceOutcome::Exit(0)
                }
                Err(_) => SliceOutcome::Exit(2),
            }
        }))
    });
    env.add_engine("reader", false).unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(
        result.lock().unwrap().take(),
        Some((Value::Bytes(b"data".to_vec()), 0))
    );
}

#[test]
fn test_async_failure_raises_os_error() {
    let result = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&result);
    let env = environment(move |_, _| {
        let observed = Arc::clone(&observed);
        let mut placeholder: Option<Value> = None;
        Ok(scripted(move |ctx, _| {
            let Some(view) = placeholder.clone() else {
                placeholder = Some(ctx.spawn_io("open", async {
                    Err::<Value, _>(io::Error::from_raw_os_error(2))
                }));
                return SliceOutcome::Idle;
            };
            let node = ctx.store().node(view.as_ref_node().unwrap()).unwrap();
            if node.is_unbound() {
                return SliceOutcome::Idle;
            }
            *observed.lock().unwrap() = node.error().cloned();
            SliceOutcome::Exit(0)
        }))
    });
    env.add_engine("opener", false).unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(
        result.lock().unwrap().take(),
        Some(OsError::from_code("open", 2).to_exception())
    );
}

#[test]
fn test_pending_feedback_keeps_engine_alive() {
    let issued = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&issued);
    let env = environment(move |_, _| {
        let flag = Arc::clone(&flag);
        Ok(scripted(move |ctx, _| {
            if !flag.swap(true, Ordering::SeqCst) {
                let _ = ctx.spawn_io("wait", async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, io::Error>(Value::Unit)
                });
            }
            SliceOutcome::Idle
        }))
    });
    let handle = env.add_engine("waiter", false).unwrap();
    assert!(wait_until(|| issued.load(Ordering::SeqCst)));
    thread::sleep(Duration::from_millis(50));
    assert!(handle.is_running());
    assert_eq!(env.live_engines(), 1);

    handle.request_termination(4);
    assert_eq!(run_reactor(&env), 4);
}

#[test]
fn test_funnel_applies_entries_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let env = environment(|_, _| Ok(listener()));
    let handle = env.add_engine("main", false).unwrap();

    for i in 0..100 {
        let seen = Arc::clone(&seen);
        handle.post(move |_| seen.lock().unwrap().push(i)).unwrap();
    }
    handle.post(|ctx| ctx.request_termination(0)).unwrap();

    assert_eq!(run_reactor(&env), 0);
    assert_eq!(*seen.lock().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_concurrent_producers_keep_their_own_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let env = environment(|_, _| Ok(listener()));
    let handle = env.add_engine("main", false).unwrap();

    let producers: Vec<_> = (0..4)
        .map(|producer| {
            let handle = handle.clone();
            let seen = Arc::clone(&seen);
            thread::spawn(move || {
                for i in 0..50 {
                    let seen = Arc::clone(&seen);
                    handle
                        .post(move |_| seen.lock().unwrap().push((producer, i)))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }
    handle.request_termination(0);
    run_reactor(&env);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 200);
    for producer in 0..4 {
        let order: Vec<_> = seen
            .iter()
            .filter(|(p, _)| *p == producer)
            .map(|(_, i)| *i)
            .collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_monitor_receives_one_notice() {
    let armed = Arc::new(AtomicBool::new(false));
    let notices = Arc::new(Mutex::new(None));
    let (armed_flag, observed) = (Arc::clone(&armed), Arc::clone(&notices));

    let env = environment(move |_, program| {
        if program.source() == "target" {
            return Ok(listener());
        }
        let target = engine_id(program.source());
        let armed = Arc::clone(&armed_flag);
        let observed = Arc::clone(&observed);
        let mut stream: Option<Value> = None;
        Ok(scripted(move |ctx, _| {
            if stream.is_none() {
                ctx.add_monitor(target).unwrap();
                ctx.add_monitor(target).unwrap();
                stream = Some(ctx.get_stream());
                armed.store(true, Ordering::SeqCst);
            }
            if ctx.port_closed() {
                let list = stream.as_ref().map(|s| ctx.store().resolve(s));
                *observed.lock().unwrap() = list.and_then(Result::ok);
                return SliceOutcome::Exit(0);
            }
            SliceOutcome::Idle
        }))
    });

    let target = env.add_engine("target", false).unwrap();
    let monitor = env
        .add_engine(format!("monitor {}", target.id().0), false)
        .unwrap();
    assert!(wait_until(|| armed.load(Ordering::SeqCst)));

    target.request_termination(0);
    assert!(wait_until(|| env.get_engine(target.id()).is_err()));
    monitor.close_stream().unwrap();
    run_reactor(&env);

    let expected = Value::list(vec![Value::record(
        "terminated",
        vec![Value::from(target.id())],
    )]);
    assert_eq!(notices.lock().unwrap().take(), Some(expected));
}

#[test]
fn test_monitoring_dead_engine_notifies_immediately() {
    let slot: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let stream_slot = Arc::clone(&slot);
    let env = environment(move |_, program| {
        if program.source() != "monitor" {
            return Ok(listener());
        }
        let stream_slot = Arc::clone(&stream_slot);
        let mut listening = false;
        Ok(scripted(move |ctx, _| {
            if !listening {
                listening = true;
                *stream_slot.lock().unwrap() = Some(ctx.get_stream());
            }
            SliceOutcome::Idle
        }))
    });
    let dead = env.add_engine("short", false).unwrap();
    dead.request_termination(0);
    assert!(wait_until(|| env.get_engine(dead.id()).is_err()));

    let monitor = env.add_engine("monitor", false).unwrap();
    env.add_monitor(monitor.id(), dead.id()).unwrap();
    assert!(wait_until(|| slot.lock().unwrap().is_some()));

    let received = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&received);
    monitor
        .post(move |ctx| {
            ctx.close_stream().unwrap();
            let stream = slot.lock().unwrap().take();
            *observed.lock().unwrap() = stream.and_then(|s| ctx.store().resolve(&s).ok());
            ctx.request_termination(0);
        })
        .unwrap();
    run_reactor(&env);

    assert_eq!(
        received.lock().unwrap().take(),
        Some(Value::list(vec![Value::record(
            "terminated",
            vec![Value::from(dead.id())]
        )]))
    );
}

#[test]
fn test_append_after_close_fails() {
    let outcome = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&outcome);
    let env = environment(move |_, _| {
        let observed = Arc::clone(&observed);
        Ok(scripted(move |ctx, _| {
            ctx.receive(Value::Int(1)).unwrap();
            let stream = ctx.get_stream();
            ctx.close_stream().unwrap();
            let rejected = matches!(ctx.receive(Value::Int(2)), Err(VmError::PortClosed));
            let contents = ctx.store().resolve(&stream).unwrap();
            *observed.lock().unwrap() = Some((rejected, contents));
            SliceOutcome::Exit(0)
        }))
    });
    env.add_engine("main", false).unwrap();
    run_reactor(&env);
    assert_eq!(
        outcome.lock().unwrap().take(),
        Some((true, Value::list(vec![Value::Int(1)])))
    );
}

#[test]
fn test_send_between_engines() {
    let received = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&received);
    let env = environment(move |_, program| {
        if let Some(rest) = program.source().strip_prefix("sender ") {
            let to = EngineId(rest.parse()?);
            return Ok(scripted(move |ctx, _| {
                let message = Value::record("hello", vec![Value::from("world")]);
                ctx.send_to_vm_port(to, &message).unwrap();
                SliceOutcome::Exit(0)
            }));
        }
        let observed = Arc::clone(&observed);
        let mut stream: Option<Value> = None;
        Ok(scripted(move |ctx, _| {
            let head = stream.get_or_insert_with(|| ctx.get_stream()).clone();
            if let Ok(Value::Cons(first, _)) = ctx.store().deref(&head) {
                *observed.lock().unwrap() = Some((**first).clone());
                return SliceOutcome::Exit(0);
            }
            SliceOutcome::Idle
        }))
    });

    let receiver = env.add_engine("receiver", false).unwrap();
    env.add_engine(format!("sender {}", receiver.id().0), false)
        .unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(
        received.lock().unwrap().take(),
        Some(Value::record("hello", vec![Value::Str("world".to_string())]))
    );
}

#[test]
fn test_alarm_resumes_engine() {
    let env = environment(|_, _| {
        let fired = Arc::new(AtomicBool::new(false));
        let mut armed = false;
        Ok(scripted(move |ctx, _| {
            if fired.load(Ordering::SeqCst) {
                return SliceOutcome::Exit(5);
            }
            if !armed {
                armed = true;
                let fired = Arc::clone(&fired);
                ctx.set_alarm(Duration::from_millis(20), move |_| {
                    fired.store(true, Ordering::SeqCst);
                });
            }
            SliceOutcome::Idle
        }))
    });
    env.add_engine("sleeper", false).unwrap();
    assert_eq!(run_reactor(&env), 5);
}

#[test]
fn test_preemption_ends_busy_slices() {
    let slices = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&slices);
    let env = environment(move |_, _| {
        let counted = Arc::clone(&counted);
        Ok(scripted(move |_, preemption| {
            while !preemption.is_requested() {
                std::hint::spin_loop();
            }
            if counted.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                SliceOutcome::Exit(0)
            } else {
                SliceOutcome::Yielded
            }
        }))
    });
    env.add_engine("busy", false).unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(slices.load(Ordering::SeqCst), 3);
}

#[test]
fn test_locator_goes_through_boot_loader() {
    let loaded = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&loaded);
    let env = environment(move |ctx, program| {
        let value = program.load(ctx)?;
        *observed.lock().unwrap() = Some(value);
        Ok(scripted(|_, _| SliceOutcome::Exit(0)))
    });
    env.set_boot_loader(|_, url| Ok(Value::Str(format!("loaded {url}"))));
    env.add_engine("x-oz://system/Main.ozf", true).unwrap();
    assert_eq!(run_reactor(&env), 0);
    assert_eq!(
        loaded.lock().unwrap().take(),
        Some(Value::Str("loaded x-oz://system/Main.ozf".to_string()))
    );
}

#[test]
fn test_locator_without_boot_loader_fails_engine() {
    let env = environment(|ctx, program| {
        program.load(ctx)?;
        Ok(scripted(|_, _| SliceOutcome::Exit(0)))
    });
    env.add_engine("x-oz://system/Main.ozf", true).unwrap();
    assert_eq!(run_reactor(&env), 1);
}

#[test]
fn test_engine_uuids_are_distinct() {
    let uuids = Arc::new(Mutex::new(HashSet::new()));
    let collected = Arc::clone(&uuids);
    let env = environment(move |_, _| {
        let collected = Arc::clone(&collected);
        Ok(scripted(move |ctx, _| {
            let mut set = collected.lock().unwrap();
            for _ in 0..10_000 {
                set.insert(Environment::gen_uuid(ctx));
            }
            SliceOutcome::Exit(0)
        }))
    });
    env.add_engine("main", false).unwrap();
    run_reactor(&env);

    let uuids = uuids.lock().unwrap();
    assert_eq!(uuids.len(), 10_000);
    assert!(uuids.iter().all(|uuid| uuid.get_version_num() == 4));
}
