use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use armature_core::{
    CommandError, Component, Runtime, RuntimeConfig, SchedulingPolicy,
};
use armature_remote::{ProcessRegistry, RemoteConnectSpec, RemoteError};

fn process(name: &str) -> Runtime {
    let config = RuntimeConfig {
        process_name: name.to_string(),
        ..RuntimeConfig::default()
    };
    Runtime::new(config)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let end = Instant::now() + deadline;
    while Instant::now() < end {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

#[test]
fn latency_bound_call_times_out_then_succeeds_with_a_longer_deadline() {
    init_logging();
    let controller = process("controller");
    let plant = process("plant");

    let mut model = Component::new("model", SchedulingPolicy::Continuous);
    let solver = model.add_provided_interface("solver").unwrap();
    solver
        .add_qualified_read::<f64, f64, _>("square", |x| Ok(x * x))
        .unwrap();
    plant.add_component(model).unwrap();

    let mut loop_component = Component::new("loop", SchedulingPolicy::Continuous);
    let required = loop_component.add_required_interface("solver").unwrap();
    let square = required.add_qualified_read::<f64, f64>("square").unwrap();
    controller.add_component(loop_component).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&controller).unwrap();
    registry.register(&plant).unwrap();

    let spec = RemoteConnectSpec::new(
        ("controller", "loop", "solver"),
        ("plant", "model", "solver"),
    )
    .with_latency(Duration::from_millis(5))
    .with_call_timeout(Duration::from_millis(2));
    let (connection, report) = registry.connect(&spec).unwrap();
    assert!(report.is_complete());
    assert!(square.is_bound());

    // The round trip needs two link crossings; a 2 ms deadline cannot cover
    // a 5 ms one-way latency.
    assert_eq!(square.call(&3.0), Err(CommandError::Timeout));
    assert!(connection.is_alive());

    // Same call, same connection, a deadline the latency fits into.
    connection.set_call_timeout(Duration::from_millis(500));
    assert_eq!(square.call(&3.0), Ok(9.0));

    connection.disconnect();
    assert_eq!(square.call(&3.0), Err(CommandError::NotConnected));
}

#[test]
fn remote_writes_are_fire_and_forget_but_ordered() {
    let client_process = process("source-process");
    let server_process = process("sink-process");

    let mut sink = Component::new("sink", SchedulingPolicy::Continuous);
    let provided = sink.add_provided_interface("queue").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        provided
            .add_write::<u32, _>("enqueue", move |value| {
                seen.lock().unwrap().push(*value);
                Ok(())
            })
            .unwrap();
    }
    server_process.add_component(sink).unwrap();

    let mut source = Component::new("source", SchedulingPolicy::Continuous);
    let required = source.add_required_interface("queue").unwrap();
    let enqueue = required.add_write::<u32>("enqueue").unwrap();
    client_process.add_component(source).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&client_process).unwrap();
    registry.register(&server_process).unwrap();
    let spec = RemoteConnectSpec::new(
        ("source-process", "source", "queue"),
        ("sink-process", "sink", "queue"),
    )
    .with_latency(Duration::from_millis(1));
    let (_connection, report) = registry.connect(&spec).unwrap();
    assert!(report.is_complete());

    let sent_in = Instant::now();
    for value in 1..=10u32 {
        enqueue.call(&value).unwrap();
    }
    // Fire and forget: ten calls return well before ten latencies elapse.
    assert!(sent_in.elapsed() < Duration::from_millis(10));

    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().unwrap().len() == 10
    }));
    assert_eq!(*seen.lock().unwrap(), (1..=10).collect::<Vec<u32>>());
}

type Deliveries = Arc<Mutex<Vec<(f64, ThreadId)>>>;

#[test]
fn remote_event_lands_on_the_subscribing_task_thread() {
    init_logging();
    let client_process = process("display-process");
    let server_process = process("thermal-process");

    let mut thermal = Component::new("thermal", SchedulingPolicy::Continuous);
    let alarms = thermal.add_provided_interface("alarms").unwrap();
    let overheat = alarms.add_event::<f64>("overheat").unwrap();
    server_process.add_component(thermal).unwrap();

    let mut display = Component::new(
        "display",
        SchedulingPolicy::Periodic(Duration::from_millis(1)),
    );
    let required = display.add_required_interface("alarms").unwrap();
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = deliveries.clone();
        required
            .add_event_handler::<f64, _>("overheat", move |temperature| {
                sink.lock()
                    .unwrap()
                    .push((*temperature, thread::current().id()));
                Ok(())
            })
            .unwrap();
    }
    client_process.add_component(display).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&client_process).unwrap();
    registry.register(&server_process).unwrap();
    let spec = RemoteConnectSpec::new(
        ("display-process", "display", "alarms"),
        ("thermal-process", "thermal", "alarms"),
    )
    .with_latency(Duration::from_millis(1));
    let (_connection, report) = registry.connect(&spec).unwrap();
    assert_eq!(report.bound_events, vec!["overheat".to_string()]);

    client_process.create("display").unwrap();
    client_process.start("display").unwrap();

    overheat.fire(&95.0);
    assert!(wait_until(Duration::from_secs(2), || {
        deliveries.lock().unwrap().len() == 1
    }));
    thread::sleep(Duration::from_millis(20));

    let deliveries = deliveries.lock().unwrap();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].0, 95.0);
    assert_ne!(deliveries[0].1, thread::current().id());

    client_process.kill("display").unwrap();
}

#[test]
fn type_name_mismatch_fails_at_bind_time_not_call_time() {
    let client_process = process("a");
    let server_process = process("b");

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("io").unwrap();
    provided.add_read::<f64, _>("level", || Ok(0.5)).unwrap();
    server_process.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("io").unwrap();
    let level = required.add_read::<f32>("level").unwrap();
    client_process.add_component(client).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&client_process).unwrap();
    registry.register(&server_process).unwrap();
    let spec = RemoteConnectSpec::new(("a", "client", "io"), ("b", "server", "io"));
    let (_connection, report) = registry.connect(&spec).unwrap();

    assert!(report.bound_commands.is_empty());
    assert_eq!(report.failed_commands.len(), 1);
    assert_eq!(report.failed_commands[0].name, "level");
    assert!(!level.is_bound());
    assert_eq!(level.call(), Err(CommandError::NotConnected));
}

#[test]
fn resolving_an_unknown_interface_is_rejected_cleanly() {
    let client_process = process("a");
    let server_process = process("b");

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    client.add_required_interface("io").unwrap();
    client_process.add_component(client).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&client_process).unwrap();
    registry.register(&server_process).unwrap();

    let spec = RemoteConnectSpec::new(("a", "client", "io"), ("b", "ghost", "io"));
    match registry.connect(&spec) {
        Err(RemoteError::Rejected(reason)) => assert!(reason.contains("ghost")),
        Err(other) => panic!("expected a rejection, got: {other}"),
        Ok(_) => panic!("connecting to a missing interface succeeded"),
    }
}

#[test]
fn callee_failure_crosses_the_wire_as_a_result_code() {
    let client_process = process("a");
    let server_process = process("b");

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("io").unwrap();
    let attempts = Arc::new(AtomicUsize::new(0));
    {
        let attempts = attempts.clone();
        provided
            .add_read::<u32, _>("next", move || {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("actuator saturated")
                }
                Ok(17)
            })
            .unwrap();
    }
    server_process.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("io").unwrap();
    let next = required.add_read::<u32>("next").unwrap();
    client_process.add_component(client).unwrap();

    let registry = ProcessRegistry::new();
    registry.register(&client_process).unwrap();
    registry.register(&server_process).unwrap();
    let spec = RemoteConnectSpec::new(("a", "client", "io"), ("b", "server", "io"));
    let (connection, _) = registry.connect(&spec).unwrap();
    connection.set_call_timeout(Duration::from_secs(1));

    match next.call() {
        Err(CommandError::CalleeFailed(message)) => assert!(message.contains("saturated")),
        other => panic!("expected CalleeFailed, got {other:?}"),
    }
    assert_eq!(next.call(), Ok(17));
}
