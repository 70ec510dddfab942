//! End-to-end behaviour of [`Hub`] against a simulated peripheral.

use std::time::Duration;

use poweredup_rs::hub::{DeviceRef, Hub, HubConfig};
use poweredup_rs::prelude::*;
use poweredup_rs::protocol::{
    BATTERY_LEVEL, FIRMWARE_REVISION, LPF2_ALL_CHARACTERISTIC, WEDO2_PORT_TYPE, WEDO2_PORT_TYPE_WRITE,
};
use poweredup_rs::util::wait_for;
use uuid::Uuid;

const HUB_FW_OK: u32 = 0x1100_0004;
const HUB_FW_OLD: u32 = 0x1000_0004;

fn config() -> HubConfig {
    HubConfig {
        wait_timeout_ms: 500,
        wait_retry_ms: 5,
        property_timeout_ms: 200,
        ..HubConfig::default()
    }
}

fn lpf2(value: &[u8]) -> Notification {
    Notification {
        characteristic: LPF2_ALL_CHARACTERISTIC,
        value: value.to_vec(),
    }
}

/// A Powered Up hub that answers property requests, acknowledges motor
/// commands with an idle feedback and reports an absolute angle of 90°
/// whenever a port value is requested.
fn simulated_hub(firmware: u32) -> impl Fn(Uuid, &[u8]) -> Vec<Notification> + Send + Sync {
    move |characteristic, data| {
        if characteristic != LPF2_ALL_CHARACTERISTIC || data.len() < 5 {
            return Vec::new();
        }
        match (data[2], data[3], data[4]) {
            // Hub property request.
            (0x01, property, 0x05) => {
                let mut reply = vec![0x00, 0x00, 0x01, property, 0x06];
                match property {
                    0x03 => reply.extend_from_slice(&firmware.to_le_bytes()),
                    0x04 => reply.extend_from_slice(&0x0000_0004u32.to_le_bytes()),
                    0x0d => reply.extend_from_slice(&[0x90, 0x84, 0x2b, 0x11, 0x22, 0x33]),
                    _ => return Vec::new(),
                }
                reply[0] = reply.len() as u8;
                vec![lpf2(&reply)]
            }
            // Port value request.
            (0x21, port, 0x00) => vec![lpf2(&[0x06, 0x00, 0x45, port, 0x5a, 0x00])],
            // Tacho and absolute motor commands finish immediately.
            (0x81, port, 0x11) if data.get(5).is_some_and(|s| (0x07..=0x0e).contains(s)) => {
                vec![lpf2(&[0x05, 0x00, 0x82, port, 0x0a])]
            }
            _ => Vec::new(),
        }
    }
}

fn attach(port: u8, device_type: u8) -> [u8; 15] {
    [
        0x0f, 0x00, 0x04, port, 0x01, device_type, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00,
        0x10,
    ]
}

async fn connected_hub(firmware: u32) -> (MockTransport, Hub<MockTransport>) {
    let mock = MockTransport::new("90:84:2b:11:22:33", Some("Train"));
    mock.respond_with(simulated_hub(firmware));
    let hub = Hub::new(mock.clone(), HubVariant::Hub, config());
    hub.connect().await.expect("connect");
    (mock, hub)
}

async fn attached(
    mock: &MockTransport,
    hub: &Hub<MockTransport>,
    port: u8,
    device_type: u8,
    name: &str,
) -> DeviceRef<MockTransport> {
    assert!(mock.inject(LPF2_ALL_CHARACTERISTIC, &attach(port, device_type)));
    hub.wait_for_device_at_port(name).await.expect("device attached")
}

fn output_subcommands(mock: &MockTransport, port: u8) -> Vec<u8> {
    mock.writes_to(LPF2_ALL_CHARACTERISTIC)
        .into_iter()
        .filter(|w| w.len() > 5 && w[2] == 0x81 && w[3] == port)
        .map(|w| w[5])
        .collect()
}

// ── Connection ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_runs_startup_sequence() {
    let mock = MockTransport::new("hub-1", Some("Train"));
    mock.respond_with(simulated_hub(HUB_FW_OK));
    let hub = Hub::new(mock.clone(), HubVariant::Hub, config());
    let mut connect = hub.on("connect").await.unwrap();

    hub.connect().await.unwrap();

    assert!(hub.is_connected());
    assert_eq!(hub.name().as_deref(), Some("Train"));
    assert_eq!(hub.firmware_version().as_deref(), Some("1.1.00.0004"));
    assert_eq!(hub.hardware_version().as_deref(), Some("0.0.00.0004"));
    assert_eq!(hub.primary_mac_address().as_deref(), Some("90:84:2b:11:22:33"));
    assert_eq!(connect.recv().await, Some(HubEvent::Connect));

    assert_eq!(mock.subscriptions(), vec![LPF2_ALL_CHARACTERISTIC]);
    let writes = mock.writes_to(LPF2_ALL_CHARACTERISTIC);
    assert_eq!(
        writes[..6],
        [
            vec![0x05, 0x00, 0x01, 0x02, 0x02],
            vec![0x05, 0x00, 0x01, 0x05, 0x02],
            vec![0x05, 0x00, 0x01, 0x06, 0x02],
            vec![0x05, 0x00, 0x01, 0x03, 0x05],
            vec![0x05, 0x00, 0x01, 0x04, 0x05],
            vec![0x05, 0x00, 0x01, 0x0d, 0x05],
        ]
    );

    assert!(matches!(hub.connect().await, Err(Error::AlreadyConnected)));
}

#[tokio::test]
async fn test_outdated_firmware_fails_connect() {
    let mock = MockTransport::new("hub-2", None);
    mock.respond_with(simulated_hub(HUB_FW_OLD));
    let hub = Hub::new(mock.clone(), HubVariant::Hub, config());

    let err = hub.connect().await.unwrap_err();
    assert!(matches!(err, Error::FirmwareOutdated { ref found, .. } if found == "1.0.00.0004"));
    assert!(err.to_string().contains("1.1.00.0004"));
    assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
    assert!(!mock.is_connected());
}

#[tokio::test]
async fn test_silent_hub_still_connects() {
    let mock = MockTransport::new("hub-3", None);
    let hub = Hub::new(
        mock.clone(),
        HubVariant::Hub,
        HubConfig {
            property_timeout_ms: 10,
            ..config()
        },
    );
    hub.connect().await.unwrap();
    assert!(hub.is_connected());
    assert_eq!(hub.firmware_version(), None);
}

#[tokio::test]
async fn test_link_loss_detaches_everything() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x02, "A").await;
    let mut disconnect = hub.on("disconnect").await.unwrap();

    mock.drop_link();

    assert_eq!(disconnect.recv().await, Some(HubEvent::Disconnect));
    assert_eq!(hub.connection_state(), ConnectionState::Disconnected);
    assert!(hub.get_devices().is_empty());
    assert!(!motor.is_connected());
    assert!(matches!(motor.set_power(10).await, Err(Error::DeviceDetached)));
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let mut disconnect = hub.on("disconnect").await.unwrap();
    hub.disconnect().await.unwrap();
    hub.disconnect().await.unwrap();
    assert!(!mock.is_connected());
    assert_eq!(disconnect.recv().await, Some(HubEvent::Disconnect));
    assert!(disconnect.try_recv().is_err());
}

// ── Device lookup ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wait_for_device_and_set_power() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x02, "A").await;

    assert_eq!(motor.device_type().unwrap(), DeviceType::TrainMotor);
    assert_eq!(motor.port_name().as_deref(), Some("A"));
    assert_eq!(
        hub.wait_for_device_by_type(DeviceType::TrainMotor)
            .await
            .unwrap()
            .port_id(),
        0
    );

    mock.clear_writes();
    motor.set_power(50).await.unwrap();
    motor.brake().await.unwrap();
    assert_eq!(
        mock.writes_to(LPF2_ALL_CHARACTERISTIC),
        vec![
            vec![0x08, 0x00, 0x81, 0x00, 0x11, 0x51, 0x00, 0x32],
            vec![0x08, 0x00, 0x81, 0x00, 0x11, 0x51, 0x00, 0x7f],
        ]
    );
}

#[tokio::test]
async fn test_wait_for_missing_device_times_out() {
    let (_mock, hub) = connected_hub(HUB_FW_OK).await;
    let err = hub.wait_for_device_at_port("B").await.unwrap_err();
    assert!(err.is_timeout());
    assert!(hub.get_device_at_port("NOPE").is_none());
}

#[tokio::test]
async fn test_handle_outlives_detach() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x01, 0x26, "B").await;

    assert!(mock.inject(LPF2_ALL_CHARACTERISTIC, &[0x05, 0x00, 0x04, 0x01, 0x00]));
    wait_for(Duration::from_millis(500), Duration::from_millis(5), || {
        let gone = hub.get_device_at_port("B").is_none();
        async move { gone.then_some(()) }
    })
    .await
    .unwrap();

    assert!(matches!(motor.set_power(10).await, Err(Error::DeviceDetached)));

    // A new device on the same port is a new instance.
    let replacement = attached(&mock, &hub, 0x01, 0x26, "B").await;
    assert!(replacement.is_connected());
    assert!(matches!(motor.info(), Err(Error::DeviceDetached)));
}

#[tokio::test]
async fn test_manual_attach_conflict() {
    let (_mock, hub) = connected_hub(HUB_FW_OK).await;
    let led = hub.manually_attach_device(DeviceType::HubLed, 50).await.unwrap();
    assert_eq!(led.port_name().as_deref(), Some("HUB_LED"));
    assert!(format!("{led:?}").contains("port_id: 50"));
    let err = hub
        .manually_attach_device(DeviceType::TrainMotor, 50)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PortTypeConflict { port_id: 50 }));
}

// ── Events ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_device_listener_subscribes_and_receives() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x26, "A").await;

    mock.clear_writes();
    let mut rotations = motor.on("rotate").await.unwrap();
    assert_eq!(
        mock.writes_to(LPF2_ALL_CHARACTERISTIC),
        vec![vec![0x0a, 0x00, 0x41, 0x00, 0x02, 0x01, 0x00, 0x00, 0x00, 0x01]]
    );
    assert_eq!(motor.mode().unwrap(), Some(2));

    mock.inject(
        LPF2_ALL_CHARACTERISTIC,
        &[0x08, 0x00, 0x45, 0x00, 0xa6, 0xff, 0xff, 0xff],
    );
    assert_eq!(
        rotations.recv().await,
        Some(DeviceEvent::Rotate { degrees: -90 })
    );
    assert_eq!(
        motor.value("rotate").unwrap(),
        Some(DeviceEvent::Rotate { degrees: -90 })
    );
}

#[tokio::test]
async fn test_virtual_port() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    attached(&mock, &hub, 0x00, 0x26, "A").await;
    attached(&mock, &hub, 0x01, 0x26, "B").await;

    mock.clear_writes();
    let create = hub.create_virtual_port("A", "B");
    let announce = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        mock.inject(
            LPF2_ALL_CHARACTERISTIC,
            &[0x09, 0x00, 0x04, 0x10, 0x02, 0x26, 0x00, 0x00, 0x01],
        );
    };
    let (pair, ()) = tokio::join!(create, announce);
    let pair = pair.unwrap();

    assert!(pair.is_virtual());
    assert_eq!(pair.port_name().as_deref(), Some("AB"));
    assert_eq!(
        mock.writes_to(LPF2_ALL_CHARACTERISTIC)[0],
        vec![0x06, 0x00, 0x61, 0x01, 0x00, 0x01]
    );

    mock.clear_writes();
    pair.set_speed((30, -30), None).await.unwrap();
    assert_eq!(output_subcommands(&mock, 0x10), vec![0x08]);
}

// ── Commands with completion ─────────────────────────────────────────────────

#[tokio::test]
async fn test_rotate_resolves_on_feedback() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x01, 0x26, "B").await;

    tokio::time::timeout(Duration::from_secs(1), motor.rotate_by_degrees(90, 50))
        .await
        .expect("feedback resolves the rotation")
        .unwrap();
    tokio::time::timeout(Duration::from_secs(1), motor.set_speed(40, Some(500)))
        .await
        .expect("feedback resolves the timed run")
        .unwrap();

    assert_eq!(output_subcommands(&mock, 0x01), vec![0x0b, 0x09]);
    assert!(!motor.is_busy().unwrap());
}

#[tokio::test]
async fn test_ramp_is_interrupted_by_next_command() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x02, "A").await;
    mock.clear_writes();

    let ramping = motor.clone();
    let ramp = tokio::spawn(async move { ramping.ramp_power(0, 100, 2000).await });
    tokio::time::sleep(Duration::from_millis(180)).await;
    motor.stop().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), ramp)
        .await
        .expect("ramp ends once interrupted")
        .unwrap();
    assert!(result.is_ok());

    let steps = mock.writes_to(LPF2_ALL_CHARACTERISTIC).len();
    assert!(steps >= 2 && steps < 20, "unexpected write count {steps}");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.writes_to(LPF2_ALL_CHARACTERISTIC).len(), steps);
    assert_eq!(
        mock.writes_to(LPF2_ALL_CHARACTERISTIC).last().map(|w| w[7]),
        Some(0x00)
    );
}

#[tokio::test]
async fn test_goto_real_zero() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x31, "A").await;
    mock.clear_writes();

    tokio::time::timeout(Duration::from_secs(1), motor.goto_real_zero(50))
        .await
        .expect("absolute reading arrives")
        .unwrap();

    let writes = mock.writes_to(LPF2_ALL_CHARACTERISTIC);
    // Subscribe to absolute position, request it, then turn back by 90°
    // in the negative direction.
    assert_eq!(writes[0][2..5], [0x41, 0x00, 0x03]);
    assert_eq!(writes[1], vec![0x05, 0x00, 0x21, 0x00, 0x00]);
    assert_eq!(writes[2][5], 0x0b);
    assert_eq!(writes[2][6..10], 90u32.to_le_bytes());
    assert_eq!(writes[2][10], (-50i8) as u8);
}

#[tokio::test]
async fn test_goto_real_zero_needs_absolute_motor() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    let motor = attached(&mock, &hub, 0x00, 0x26, "A").await;
    assert!(matches!(
        motor.goto_real_zero(50).await,
        Err(Error::Unsupported(_))
    ));
}

// ── Hub commands ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_set_name() {
    let (mock, hub) = connected_hub(HUB_FW_OK).await;
    mock.clear_writes();

    assert!(matches!(
        hub.set_name("a name far too long").await,
        Err(Error::InvalidArgument(_))
    ));
    hub.set_name("Express").await.unwrap();

    let expected = {
        let mut v = vec![0x0a, 0x00, 0x01, 0x01, 0x01];
        v.extend_from_slice(b"Express");
        v[0] = v.len() as u8;
        v
    };
    assert_eq!(
        mock.writes_to(LPF2_ALL_CHARACTERISTIC),
        vec![expected.clone(), expected]
    );
    assert_eq!(hub.name().as_deref(), Some("Express"));
}

// ── WeDo 2.0 ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_wedo2_connect_and_attach() {
    let mock = MockTransport::new("wedo", Some("LPF2 Smart Hub"));
    mock.set_read(BATTERY_LEVEL, &[0x55]);
    mock.set_read(FIRMWARE_REVISION, b"1.0.0.0000");
    let hub = Hub::new(mock.clone(), HubVariant::WeDo2SmartHub, config());
    hub.connect().await.unwrap();

    assert_eq!(hub.battery_level(), Some(0x55));
    assert_eq!(hub.firmware_version().as_deref(), Some("1.0.0.0000"));
    assert_eq!(mock.discovered_services().len(), 4);
    assert_eq!(mock.subscriptions().len(), 5);

    let mut tilt = hub.on("tilt").await.unwrap();
    mock.inject(WEDO2_PORT_TYPE, &[0x01, 0x01, 0x00, 0x22]);
    let sensor = hub.wait_for_device_at_port("A").await.unwrap();
    assert_eq!(sensor.device_type().unwrap(), DeviceType::TiltSensor);
    assert_eq!(mock.writes_to(WEDO2_PORT_TYPE_WRITE).len(), 1);

    mock.inject(
        poweredup_rs::protocol::WEDO2_SENSOR_VALUE,
        &[0x02, 0x01, 0x0a, 0xf6],
    );
    match tilt.recv().await {
        Some(HubEvent::Device { port_id, reading, .. }) => {
            assert_eq!(port_id, 1);
            assert_eq!(reading, DeviceEvent::Tilt { x: 10, y: -10, z: None });
        }
        other => panic!("unexpected {other:?}"),
    }
}
