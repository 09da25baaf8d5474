use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use armature_core::{
    Component, ComponentLogic, CommandError, ReadFn, Runtime, SchedulingPolicy, TaskState,
};

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

/// Calls a bound read command once per step and tallies the outcomes.
struct SpeedReader {
    get_speed: ReadFn<f64>,
    ok_calls: Arc<AtomicUsize>,
    not_connected: Arc<AtomicUsize>,
}

impl ComponentLogic for SpeedReader {
    fn step(&mut self) {
        match self.get_speed.call() {
            Ok(speed) => {
                assert!(speed >= 0.0);
                self.ok_calls.fetch_add(1, Ordering::SeqCst);
            }
            Err(CommandError::NotConnected) => {
                self.not_connected.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => panic!("unexpected call failure: {e}"),
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn killing_the_provider_turns_calls_into_not_connected() {
    init_logging();
    let runtime = Runtime::with_defaults();

    let mut provider = Component::new(
        "speed-sensor",
        SchedulingPolicy::Periodic(Duration::from_millis(10)),
    );
    let telemetry = provider.add_provided_interface("telemetry").unwrap();
    telemetry.add_read::<f64, _>("get_speed", || Ok(12.5)).unwrap();
    runtime.add_component(provider).unwrap();

    let mut consumer = Component::new("display", SchedulingPolicy::Continuous);
    let required = consumer.add_required_interface("telemetry").unwrap();
    let get_speed = required.add_read::<f64>("get_speed").unwrap();
    let ok_calls = Arc::new(AtomicUsize::new(0));
    let not_connected = Arc::new(AtomicUsize::new(0));
    consumer.set_logic(SpeedReader {
        get_speed: get_speed.clone(),
        ok_calls: ok_calls.clone(),
        not_connected: not_connected.clone(),
    });
    runtime.add_component(consumer).unwrap();

    let (_, report) = runtime
        .connect("display", "telemetry", "speed-sensor", "telemetry")
        .unwrap();
    assert!(report.is_complete());
    assert!(get_speed.is_bound());

    runtime.create_all();
    runtime.start_all();
    assert!(wait_until(Duration::from_secs(2), || {
        ok_calls.load(Ordering::SeqCst) >= 5
    }));
    assert_eq!(not_connected.load(Ordering::SeqCst), 0);

    // Killing the provider mid-run unbinds its connections; the consumer
    // keeps stepping and sees NotConnected instead of crashing.
    runtime.kill("speed-sensor").unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        not_connected.load(Ordering::SeqCst) >= 5
    }));
    assert_eq!(runtime.state("display").unwrap(), TaskState::Active);
    assert!(!get_speed.is_bound());

    runtime.kill("display").unwrap();
}

type Deliveries = Arc<Mutex<Vec<(f64, ThreadId)>>>;

fn subscriber(runtime: &Runtime, name: &str) -> Deliveries {
    let mut component = Component::new(name, SchedulingPolicy::Periodic(Duration::from_millis(1)));
    let required = component.add_required_interface("alarms").unwrap();
    let deliveries: Deliveries = Arc::new(Mutex::new(Vec::new()));
    let sink = deliveries.clone();
    required
        .add_event_handler::<f64, _>("overheat", move |temperature| {
            sink.lock()
                .unwrap()
                .push((*temperature, thread::current().id()));
            Ok(())
        })
        .unwrap();
    runtime.add_component(component).unwrap();
    deliveries
}

#[test]
fn fired_event_reaches_each_subscriber_exactly_once_on_its_own_thread() {
    init_logging();
    let runtime = Runtime::with_defaults();

    let mut source = Component::new("thermal", SchedulingPolicy::Continuous);
    let alarms = source.add_provided_interface("alarms").unwrap();
    let overheat = alarms.add_event::<f64>("overheat").unwrap();
    runtime.add_component(source).unwrap();

    let first = subscriber(&runtime, "fan-control");
    let second = subscriber(&runtime, "logger");
    runtime
        .connect("fan-control", "alarms", "thermal", "alarms")
        .unwrap();
    runtime
        .connect("logger", "alarms", "thermal", "alarms")
        .unwrap();
    assert_eq!(overheat.subscriber_count(), 2);

    runtime.create("fan-control").unwrap();
    runtime.create("logger").unwrap();
    runtime.start("fan-control").unwrap();
    runtime.start("logger").unwrap();

    overheat.fire(&95.0);
    assert!(wait_until(Duration::from_secs(2), || {
        first.lock().unwrap().len() == 1 && second.lock().unwrap().len() == 1
    }));

    // Settling time: exactly one delivery each, never a second one.
    thread::sleep(Duration::from_millis(20));
    let first = first.lock().unwrap().clone();
    let second = second.lock().unwrap().clone();
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
    assert_eq!(first[0].0, 95.0);
    assert_eq!(second[0].0, 95.0);
    // Each handler ran on its own task's thread, not on the firing thread.
    assert_ne!(first[0].1, thread::current().id());
    assert_ne!(second[0].1, thread::current().id());
    assert_ne!(first[0].1, second[0].1);

    runtime.kill_all();
}

#[test]
fn reconnecting_the_same_pair_is_idempotent() {
    let runtime = Runtime::with_defaults();

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("io").unwrap();
    provided.add_void("ping", || Ok(())).unwrap();
    let tick = provided.add_event_void("tick").unwrap();
    runtime.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("io").unwrap();
    let ping = required.add_void("ping").unwrap();
    required.add_event_handler_void("tick", || Ok(())).unwrap();
    runtime.add_component(client).unwrap();

    let (first_id, _) = runtime.connect("client", "io", "server", "io").unwrap();
    let (second_id, report) = runtime.connect("client", "io", "server", "io").unwrap();
    assert_eq!(first_id, second_id);
    assert!(report.is_complete());
    assert!(ping.is_bound());
    // No duplicate subscriber piled up on the repeated connect.
    assert_eq!(tick.subscriber_count(), 1);
}

#[test]
fn disconnect_then_reconnect_restores_full_behavior() {
    let runtime = Runtime::with_defaults();

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("counter").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    {
        let hits = hits.clone();
        provided
            .add_void("bump", move || {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    runtime.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("counter").unwrap();
    let bump = required.add_void("bump").unwrap();
    runtime.add_component(client).unwrap();

    assert_eq!(bump.call(), Err(CommandError::NotConnected));

    let (id, _) = runtime.connect("client", "counter", "server", "counter").unwrap();
    bump.call().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    runtime.disconnect(id).unwrap();
    assert!(!bump.is_bound());
    assert_eq!(bump.call(), Err(CommandError::NotConnected));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    runtime.connect("client", "counter", "server", "counter").unwrap();
    bump.call().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[test]
fn partial_binding_reports_the_names_that_failed() {
    let runtime = Runtime::with_defaults();

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("mixed").unwrap();
    provided.add_read::<f64, _>("position", || Ok(0.25)).unwrap();
    provided.add_read::<f64, _>("velocity", || Ok(1.5)).unwrap();
    runtime.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("mixed").unwrap();
    let position = required.add_read::<f64>("position").unwrap();
    // Payload type disagrees with the provider.
    let velocity = required.add_read::<f32>("velocity").unwrap();
    // Nothing on the provider answers to this name.
    let torque = required.add_read::<f64>("torque").unwrap();
    runtime.add_component(client).unwrap();

    let (_, report) = runtime.connect("client", "mixed", "server", "mixed").unwrap();
    assert_eq!(report.bound_commands, vec!["position".to_string()]);
    assert!(!report.is_complete());
    let failed: Vec<&str> = report.failed_commands.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(failed, vec!["velocity", "torque"]);

    // The connection is still usable for everything that did bind.
    assert_eq!(position.call(), Ok(0.25));
    assert_eq!(velocity.call(), Err(CommandError::NotConnected));
    assert_eq!(torque.call(), Err(CommandError::NotConnected));
}

#[test]
fn disabled_command_reports_disabled_until_reenabled() {
    let runtime = Runtime::with_defaults();

    let mut server = Component::new("server", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("io").unwrap();
    provided.add_read::<u32, _>("status", || Ok(7)).unwrap();
    runtime.add_component(server).unwrap();

    let mut client = Component::new("client", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("io").unwrap();
    let status = required.add_read::<u32>("status").unwrap();
    runtime.add_component(client).unwrap();

    runtime.connect("client", "io", "server", "io").unwrap();
    assert_eq!(status.call(), Ok(7));

    provided.set_command_enabled("status", false).unwrap();
    assert_eq!(status.call(), Err(CommandError::Disabled));
    // Disabled is not unbound.
    assert!(status.is_bound());

    provided.set_command_enabled("status", true).unwrap();
    assert_eq!(status.call(), Ok(7));
}

struct StepWrites {
    queue: armature_core::WriteFn<u32>,
    next: u32,
}

impl ComponentLogic for StepWrites {
    fn step(&mut self) {
        if self.next <= 20 {
            let _ = self.queue.call(&self.next);
            self.next += 1;
        }
    }
}

#[test]
fn sequential_writes_arrive_in_order() {
    let runtime = Runtime::with_defaults();

    let mut server = Component::new("sink", SchedulingPolicy::Continuous);
    let provided = server.add_provided_interface("queue").unwrap();
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
    runtime.add_component(server).unwrap();

    let mut client = Component::new("source", SchedulingPolicy::Continuous);
    let required = client.add_required_interface("queue").unwrap();
    let enqueue = required.add_write::<u32>("enqueue").unwrap();
    client.set_logic(StepWrites {
        queue: enqueue,
        next: 1,
    });
    runtime.add_component(client).unwrap();

    runtime.connect("source", "queue", "sink", "queue").unwrap();
    runtime.create("source").unwrap();
    runtime.start("source").unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().unwrap().len() == 20
    }));
    runtime.kill("source").unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (1..=20).collect::<Vec<u32>>());
}

#[test]
fn removing_a_running_component_is_refused() {
    let runtime = Runtime::with_defaults();
    let mut component = Component::new("busy", SchedulingPolicy::Continuous);
    component.set_logic(armature_core::PassiveLogic);
    runtime.add_component(component).unwrap();

    runtime.create("busy").unwrap();
    runtime.start("busy").unwrap();
    assert!(runtime.remove_component("busy").is_err());

    runtime.kill("busy").unwrap();
    runtime.remove_component("busy").unwrap();
    assert!(runtime.state("busy").is_err());
}
