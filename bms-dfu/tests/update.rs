mod common;

use std::time::Duration;

use bms_dfu::can::{CMD_ID, DAT_ID};
use bms_dfu::{
    Client, ClientConfig, Command, CrcKind, Error, FileCrc, Firmware, PacketLen, Progress, State,
    Station as Stations, UpdateOptions, Updater,
};
use common::{config, payloads, Fault, SimBms, Station};

fn client(station: Station) -> (Client<SimBms>, SimBms) {
    client_with(station, config())
}

fn client_with(station: Station, config: ClientConfig) -> (Client<SimBms>, SimBms) {
    let sim = SimBms::new(station);
    let mut client = Client::new(sim.clone(), config);
    client.connect(0, 500_000).unwrap();
    (client, sim)
}

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7) as u8).collect()
}

fn options() -> UpdateOptions {
    UpdateOptions {
        address: 3,
        ..UpdateOptions::default()
    }
}

fn opcodes(sim: &SimBms) -> Vec<u8> {
    payloads(&sim.station().sent, CMD_ID)
        .iter()
        .map(|p| p[2])
        .collect()
}

#[test]
fn transfers_image_packet_by_packet() {
    let (mut client, sim) = client(Station::default());
    let firmware = Firmware::new(image(256), PacketLen::new(64).unwrap()).unwrap();

    let report = Updater::new(&mut client, options())
        .run(&firmware, |_| {})
        .unwrap();

    assert_eq!(report.packets, 4);
    assert_eq!(report.cells, 4);
    assert_eq!(report.crc, FileCrc::Crc16(bms_dfu::crc16(firmware.as_bytes(), 0xFFFF)));

    let station = sim.station();
    assert_eq!(station.packet_len, 64);
    assert_eq!(station.application_len, 256);
    assert_eq!(station.seqs, vec![1, 2, 3, 4]);
    assert_eq!(station.verified_packets, 4);
    assert_eq!(station.image, firmware.as_bytes());
    assert_eq!(station.verify_all.len(), 1);
    assert_eq!(station.verify_all[0].0, 0);
    assert_eq!(payloads(&station.sent, DAT_ID).len(), 256 / 8);
    drop(station);

    let opcodes = opcodes(&sim);
    assert_eq!(&opcodes[..4], &[0x10, 0x29, 0x28, 0x30]);
    assert_eq!(opcodes.iter().filter(|&&op| op == 0x45).count(), 4);
    assert_eq!(opcodes.iter().filter(|&&op| op == 0x50).count(), 1);
    assert_eq!(&opcodes[opcodes.len() - 2..], &[0x60, 0x61]);
}

#[test]
fn default_packet_length_is_not_negotiated() {
    let (mut client, sim) = client(Station::default());
    let firmware = Firmware::new(image(300), PacketLen::DEFAULT).unwrap();

    Updater::new(&mut client, options())
        .run(&firmware, |_| {})
        .unwrap();

    let opcodes = opcodes(&sim);
    assert!(!opcodes.contains(&0x29));
    assert!(!opcodes.contains(&0x28));
    assert_eq!(sim.station().application_len, 384);
    assert_eq!(sim.station().seqs, vec![1, 2, 3]);
}

#[test]
fn polls_while_in_progress() {
    let station = Station {
        statuses: [0x0C, 0x0C, 0x0C].into(),
        ..Station::default()
    };
    let (mut client, sim) = client(station);
    let firmware = Firmware::new(image(64), PacketLen::new(32).unwrap()).unwrap();

    let mut states = Vec::new();
    let mut statuses = Vec::new();
    Updater::new(&mut client, options())
        .run(&firmware, |progress| match progress {
            Progress::State(state) => states.push(state),
            Progress::Status(status) => statuses.push(status),
            Progress::Packet { .. } => {}
        })
        .unwrap();

    assert_eq!(sim.station().status_polls, 4);
    assert_eq!(statuses.len(), 4);
    assert!(statuses[..3].iter().all(|s| s.is_in_progress()));
    assert_eq!(
        states,
        vec![
            State::Prepared,
            State::LengthNegotiated,
            State::Transferring(1),
            State::Transferring(2),
            State::AllVerified,
            State::UpdateTriggered,
            State::Polling,
            State::Succeeded,
        ]
    );
}

#[test]
fn failure_status_stops_polling() {
    let station = Station {
        statuses: [0x05, 0x0C].into(),
        ..Station::default()
    };
    let (mut client, sim) = client(station);
    let firmware = Firmware::new(image(128), PacketLen::DEFAULT).unwrap();

    let mut updater = Updater::new(&mut client, options());
    let error = updater.run(&firmware, |_| {}).unwrap_err();

    assert!(matches!(
        error,
        Error::Aborted {
            state: State::Polling,
            ..
        }
    ));
    assert!(matches!(error.root(), Error::UpdateFailed(0x05)));
    assert_eq!(updater.state(), State::Failed);
    assert_eq!(sim.station().status_polls, 1);
}

#[test]
fn silent_status_poll_fails_update() {
    let station = Station {
        fault: Some(Fault::Silent(0x61)),
        ..Station::default()
    };
    let mut config = config();
    config.timing.status = Duration::from_millis(50);
    let (mut client, sim) = client_with(station, config);
    let firmware = Firmware::new(image(128), PacketLen::DEFAULT).unwrap();

    let mut states = Vec::new();
    let mut updater = Updater::new(&mut client, options());
    let error = updater
        .run(&firmware, |progress| {
            if let Progress::State(state) = progress {
                states.push(state);
            }
        })
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Aborted {
            state: State::Polling,
            ..
        }
    ));
    assert!(matches!(
        error.root(),
        Error::ResponseTimeout {
            command: Command::GetUpdateStatus,
            ..
        }
    ));
    assert_eq!(updater.state(), State::Failed);
    assert_eq!(states.last(), Some(&State::Failed));
    assert_eq!(sim.station().update_requests.len(), 1);
}

#[test]
fn rejected_packet_aborts_transfer() {
    let station = Station {
        fault: Some(Fault::BadAck(0x45)),
        ..Station::default()
    };
    let (mut client, sim) = client(station);
    let firmware = Firmware::new(image(256), PacketLen::new(64).unwrap()).unwrap();

    let mut packets = 0;
    let error = Updater::new(&mut client, options())
        .run(&firmware, |progress| {
            if let Progress::Packet { .. } = progress {
                packets += 1;
            }
        })
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Aborted {
            state: State::Transferring(1),
            ..
        }
    ));
    assert_eq!(packets, 0);
    assert_eq!(sim.station().seqs, vec![1]);
    assert!(!opcodes(&sim).contains(&0x50));
}

#[test]
fn station_outside_bootloader_aborts_before_transfer() {
    let station = Station {
        fault: Some(Fault::NotInBootloader),
        ..Station::default()
    };
    let (mut client, sim) = client(station);
    let firmware = Firmware::new(image(128), PacketLen::DEFAULT).unwrap();

    let error = Updater::new(&mut client, options())
        .run(&firmware, |_| {})
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Aborted {
            state: State::Idle,
            ..
        }
    ));
    assert!(matches!(error.root(), Error::NotInBootloader(_)));
    assert!(payloads(&sim.station().sent, DAT_ID).is_empty());
}

#[test]
fn packet_length_must_be_confirmed() {
    let station = Station {
        fault: Some(Fault::IgnorePacketLen),
        ..Station::default()
    };
    let (mut client, _sim) = client(station);
    let firmware = Firmware::new(image(128), PacketLen::new(16).unwrap()).unwrap();

    let error = Updater::new(&mut client, options())
        .run(&firmware, |_| {})
        .unwrap_err();

    assert!(matches!(
        error,
        Error::Aborted {
            state: State::Prepared,
            ..
        }
    ));
    assert!(matches!(
        error.root(),
        Error::EchoMismatch {
            sent: 16,
            echoed: 128,
            ..
        }
    ));
}

#[test]
fn crc32_and_all_stations() {
    let (mut client, sim) = client(Station::default());
    let firmware = Firmware::new(image(200), PacketLen::new(8).unwrap()).unwrap();
    let options = UpdateOptions {
        address: 3,
        station: Stations::All,
        crc: CrcKind::Crc32,
    };

    let report = Updater::new(&mut client, options)
        .run(&firmware, |_| {})
        .unwrap();

    assert_eq!(report.packets, 25);
    let station = sim.station();
    assert_eq!(
        station.verify_all,
        vec![(1, bms_dfu::crc32(firmware.as_bytes(), 0))]
    );
    assert_eq!(station.update_requests.len(), 1);
    assert_eq!(station.update_requests[0][1], 0x00);
}
