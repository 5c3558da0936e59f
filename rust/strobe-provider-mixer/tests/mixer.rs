//! Mixer module driven through a runtime the way a status bar would:
//! events posted from a connection thread, expressions bound as bytecode.

use std::rc::Rc;
use strobe_core::{Program, ProgramBuilder, Value};
use strobe_provider_mixer::{
    BackendCall, ChannelVolume, Device, Interface, MixerEvent, MixerModule, RecordingBackend,
};
use strobe_vm::{EvalMode, Runtime};
use tracing_subscriber::{fmt, EnvFilter};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}

fn stereo(index: u32, name: &str, left: f64, right: f64) -> Device {
    Device {
        description: Some(format!("{} speakers", name)),
        icon: Some("audio-card".into()),
        channels: vec![
            ChannelVolume::new("front-left", left),
            ChannelVolume::new("front-right", right),
        ],
        ..Device::new(index, name)
    }
}

fn setup() -> (Runtime, Rc<MixerModule>, Rc<RecordingBackend>) {
    init_logging();
    let runtime = Runtime::default();
    let backend = Rc::new(RecordingBackend::new());
    let module = MixerModule::install(&runtime, backend.clone()).unwrap();
    (runtime, module, backend)
}

/// Helper: `name(args...)` with text arguments.
fn call(name: &str, args: &[&str]) -> Program {
    let mut b = ProgramBuilder::new();
    for arg in args {
        b.push_text(arg);
    }
    b.call(name, args.len() as u8);
    b.finish()
}

fn updated(interface: Interface, device: Device) -> MixerEvent {
    MixerEvent::DeviceUpdated { interface, device }
}

#[test]
fn events_from_connection_thread() {
    let (runtime, module, _) = setup();
    let sender = module.sender();
    std::thread::spawn(move || {
        sender
            .send(updated(Interface::Sink, stereo(3, "usb", 40.0, 60.0)))
            .unwrap();
        sender
            .send(MixerEvent::ServerDefaults {
                sink: "usb".into(),
                source: "mic".into(),
            })
            .unwrap();
    })
    .join()
    .unwrap();

    let volume = call("Mixer", &["sink-volume"]);
    assert_eq!(runtime.evaluate(&volume, &[]), Value::Unset);
    assert_eq!(runtime.dispatch_pending(), 2);
    assert_eq!(runtime.evaluate(&volume, &[]), Value::Number(50.0));
}

#[test]
fn queries_by_address() {
    let (runtime, module, _) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 60.0)));
    module.apply(updated(Interface::Sink, stereo(5, "hdmi", 10.0, 10.0)));

    let eval = |args: &[&str]| runtime.evaluate(&call("Mixer", args), &[]);
    assert_eq!(eval(&["sink-volume", "@mixer-sink-5"]), Value::Number(10.0));
    assert_eq!(eval(&["sink-volume", "usb:front-right"]), Value::Number(60.0));
    assert_eq!(eval(&["sink-mute", "usb"]), Value::Boolean(false));
    assert_eq!(eval(&["sink-description", "hdmi"]), Value::text("hdmi speakers"));
    assert_eq!(eval(&["sink-port", "hdmi"]), Value::text(""));
    assert_eq!(eval(&["sink-count"]), Value::Number(2.0));
    assert_eq!(eval(&["source-count"]), Value::Number(0.0));
    assert_eq!(eval(&["sink-loudness", "usb"]), Value::text("invalid query: loudness"));
    assert_eq!(eval(&["sink-volume", "@mixer-sink-9"]), Value::Unset);
    assert_eq!(eval(&["card-volume", "usb"]), Value::Unset);
}

#[test]
fn device_update_invalidates_cached_query() {
    let (runtime, module, _) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 40.0)));

    let handle = runtime.bind_expression(
        call("Mixer", &["sink-volume", "@mixer-sink-3"]),
        EvalMode::Eager,
    );
    assert_eq!(runtime.evaluate_cached(handle), Value::Number(40.0));

    module.apply(updated(Interface::Sink, stereo(3, "usb", 70.0, 70.0)));
    assert_eq!(runtime.refresh(), vec![handle]);
    assert_eq!(runtime.evaluate_cached(handle), Value::Number(70.0));
}

#[test]
fn channel_announcements_and_ack() {
    let (runtime, module, _) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 60.0)));
    // A repeat update of a known device announces nothing new.
    module.apply(updated(Interface::Sink, stereo(3, "usb", 45.0, 60.0)));

    let channel = call("MixerChannel", &["channel"]);
    let device = call("MixerChannel", &["device"]);
    let number = call("MixerChannel", &["ChannelNumber"]);
    let ack = call("MixerChannelAck", &[]);

    assert_eq!(runtime.evaluate(&channel, &[]), Value::text("front-left"));
    assert_eq!(runtime.evaluate(&device, &[]), Value::text("@mixer-sink-3"));
    assert_eq!(runtime.evaluate(&number, &[]), Value::text("0"));

    runtime.run_action(&ack, &[]).unwrap();
    assert_eq!(runtime.evaluate(&channel, &[]), Value::text("front-right"));
    runtime.run_action(&ack, &[]).unwrap();
    assert_eq!(runtime.evaluate(&channel, &[]), Value::Unset);
}

#[test]
fn removal_announcement() {
    let (runtime, module, _) = setup();
    module.apply(updated(Interface::Client, stereo(12, "player", 80.0, 80.0)));
    runtime.run_action(&call("MixerChannelAck", &[]), &[]).unwrap();
    runtime.run_action(&call("MixerChannelAck", &[]), &[]).unwrap();

    module.apply(MixerEvent::DeviceRemoved {
        interface: Interface::Client,
        index: 12,
    });
    // Unknown devices are not announced.
    module.apply(MixerEvent::DeviceRemoved {
        interface: Interface::Client,
        index: 99,
    });

    let removed = call("MixerChannel", &["RemovedDevice"]);
    assert_eq!(runtime.evaluate(&removed, &[]), Value::text("@mixer-client-12"));
    assert_eq!(
        runtime.evaluate(&call("Mixer", &["client-count"]), &[]),
        Value::Number(0.0)
    );
    runtime
        .run_action(&call("MixerChannelAckRemoved", &[]), &[])
        .unwrap();
    assert_eq!(runtime.evaluate(&removed, &[]), Value::Unset);
}

#[test]
fn volume_and_mute_commands() {
    let (runtime, module, backend) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 60.0)));

    let run = |args: &[&str]| runtime.run_action(&call("MixerCmd", args), &[]).unwrap();
    run(&["sink-volume +10", "@mixer-sink-3"]);
    run(&["sink-volume 100", "usb:front-left"]);
    run(&["sink-volume +200", "usb"]);
    run(&["sink-mute toggle", "usb"]);
    run(&["sink-volume loud", "usb"]);
    run(&["sink-volume NaN", "usb:front-left"]);
    run(&["sink-volume +5", "nowhere"]);

    assert_eq!(
        backend.take(),
        vec![
            BackendCall::SetVolume {
                interface: Interface::Sink,
                index: 3,
                volumes: vec![50.0, 70.0],
            },
            BackendCall::SetVolume {
                interface: Interface::Sink,
                index: 3,
                volumes: vec![100.0, 60.0],
            },
            BackendCall::SetVolume {
                interface: Interface::Sink,
                index: 3,
                volumes: vec![150.0, 150.0],
            },
            BackendCall::SetMute {
                interface: Interface::Sink,
                index: 3,
                mute: true,
            },
        ]
    );
}

#[test]
fn client_set_sink() {
    let (runtime, module, backend) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 60.0)));
    module.apply(updated(
        Interface::Client,
        Device {
            client: Some(77),
            ..stereo(12, "player", 80.0, 80.0)
        },
    ));
    module.apply(updated(Interface::Client, stereo(13, "orphan", 80.0, 80.0)));

    let run = |args: &[&str]| runtime.run_action(&call("MixerCmd", args), &[]).unwrap();
    run(&["client-set-sink @mixer-sink-3", "@mixer-client-12"]);
    run(&["client-set-sink usb", "@mixer-client-13"]);
    run(&["sink-set-sink usb", "usb"]);
    assert_eq!(backend.take(), vec![BackendCall::MoveClient { stream: 12, sink: 3 }]);
}

#[test]
fn client_rename_updates_description() {
    let (runtime, module, _) = setup();
    let stream = Device {
        client: Some(77),
        description: None,
        ..stereo(12, "player", 80.0, 80.0)
    };
    module.apply(updated(Interface::Client, stream.clone()));
    module.apply(MixerEvent::ClientRenamed {
        client: 77,
        name: "Music".into(),
    });

    let description = runtime.bind_expression(
        call("Mixer", &["client-description", "@mixer-client-12"]),
        EvalMode::Lazy,
    );
    assert_eq!(runtime.evaluate_cached(description), Value::text("Music"));

    // A later stream update without a description keeps the client name.
    module.apply(updated(Interface::Client, stream));
    assert_eq!(runtime.evaluate_cached(description), Value::text("Music"));
}

#[test]
fn fixed_default_beats_server_default() {
    let (runtime, module, _) = setup();
    module.apply(updated(Interface::Sink, stereo(3, "usb", 40.0, 40.0)));
    module.apply(updated(Interface::Sink, stereo(5, "hdmi", 90.0, 90.0)));
    module.apply(MixerEvent::ServerDefaults {
        sink: "usb".into(),
        source: "mic".into(),
    });

    let handle = runtime.bind_expression(call("Mixer", &["sink-volume"]), EvalMode::Lazy);
    assert_eq!(runtime.evaluate_cached(handle), Value::Number(40.0));

    runtime
        .run_action(&call("MixerSetDefaultSink", &["hdmi"]), &[])
        .unwrap();
    assert_eq!(runtime.evaluate_cached(handle), Value::Number(90.0));

    module.apply(MixerEvent::ServerDefaults {
        sink: "usb".into(),
        source: "mic".into(),
    });
    assert_eq!(runtime.evaluate_cached(handle), Value::Number(90.0));
}
