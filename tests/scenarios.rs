//! End-to-end scenarios against a simulated chip.

use std::time::Duration;

use ftdi_engine::mpsse::jtag::{JtagBus, JtagConfig, TapState};
use ftdi_engine::mpsse::spi::{SpiBus, SpiConfig, SpiMode};
use ftdi_engine::uart::convert_baudrate;
use ftdi_engine::{
    BitOrder, ChipType, Error, ErrorKind, Interface, LineErrors, Port, PortMode, PortOptions,
    ProtocolViolation, SimulatedChip, UartConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn options() -> PortOptions {
    PortOptions::default()
        .with_read_timeout(Duration::from_millis(50))
        .with_mode_settle(Duration::ZERO)
}

fn open(chip: ChipType) -> (Port<SimulatedChip>, SimulatedChip) {
    init_logging();
    let sim = SimulatedChip::new(chip);
    let port = Port::with_transport(sim.clone(), chip, Interface::A, options()).unwrap();
    (port, sim)
}

#[test]
fn mpsse_ops_refused_until_mode_switch() {
    let (mut port, _) = open(ChipType::Ft232H);
    let cfg = SpiMode::Mode0.shift_config(BitOrder::MsbFirst);

    let err = port.shift_bytes(&[0xAA], cfg).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ProtocolState);
    assert!(matches!(
        err,
        Error::ProtocolState(ProtocolViolation::WrongMode {
            required: PortMode::Mpsse,
            current: PortMode::Reset,
        })
    ));

    port.set_mode(PortMode::Mpsse, 0).unwrap();
    port.set_loopback(true).unwrap();
    assert_eq!(port.shift_bytes(&[0xAA], cfg).unwrap(), [0xAA]);
}

#[test]
fn baud_9600_at_48mhz() {
    // 48 MHz / 16 / 9600 = 312.5: divisor 312 plus 4/8
    let rate = convert_baudrate(9600, ChipType::Ft232R, 1).unwrap();
    assert_eq!(rate.base_hz, 3_000_000);
    assert_eq!(rate.divisor, 312);
    assert_eq!(rate.fraction_eighths, 4);
    assert_eq!(rate.actual, 9600);
    assert_eq!((rate.value, rate.index), (0x4138, 0));

    let (mut port, sim) = open(ChipType::Ft232R);
    let applied = port.configure_uart(&UartConfig::new(9600)).unwrap();
    assert_eq!(applied, rate);
    assert_eq!(sim.baud_divisor(), (0x4138, 0));
    assert_eq!(port.baud(), Some(rate));
}

#[test]
fn uart_round_trip_with_line_errors() {
    let (mut port, sim) = open(ChipType::Ft232R);
    port.configure_uart(&UartConfig::new(115_200)).unwrap();
    sim.set_uart_echo(true);

    port.uart_write(b"ping").unwrap();
    assert_eq!(port.uart_read_exact(4).unwrap(), b"ping");

    sim.inject_line_errors(LineErrors::FRAMING);
    sim.queue_rx(&[0x00]);
    assert_eq!(port.uart_read_exact(1).unwrap(), [0x00]);
    assert!(port
        .device_mut()
        .take_line_errors()
        .contains(LineErrors::FRAMING));
}

#[test]
fn exact_read_spans_many_frames() {
    let (mut port, sim) = open(ChipType::Ft2232H);
    let data: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    sim.set_max_payload_per_packet(7);
    sim.set_empty_polls(2);
    sim.queue_rx(&data);

    assert_eq!(port.uart_read_exact(1000).unwrap(), &data[..1000]);
    assert_eq!(port.uart_read_exact(2000).unwrap(), &data[1000..]);
    assert!(matches!(port.uart_read_exact(1), Err(Error::Timeout)));
}

#[test]
fn partial_read_is_not_a_timeout() {
    let (mut port, sim) = open(ChipType::Ft232R);
    sim.queue_rx(&[1, 2, 3]);
    match port.uart_read_exact(8) {
        Err(Error::PartialRead { expected, received }) => assert_eq!((expected, received), (8, 3)),
        other => panic!("unexpected {other:?}"),
    }
    // The torn data is gone
    assert!(matches!(port.uart_read_exact(1), Err(Error::Timeout)));
}

#[test]
fn disconnect_is_permanent() {
    let (mut port, sim) = open(ChipType::Ft232H);
    port.set_mode(PortMode::Mpsse, 0).unwrap();
    let spi = SpiBus::new(&mut port, SpiConfig::new(SpiMode::Mode0, 1_000_000)).unwrap();

    sim.disconnect();
    let err = spi.transfer(&mut port, &[0x9F, 0, 0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_disconnect());

    // Plugging the same chip back does not revive the handle
    sim.reconnect();
    for err in [
        spi.transfer(&mut port, &[0x9F]).unwrap_err(),
        port.read_gpio().unwrap_err(),
        port.set_mode(PortMode::Reset, 0).unwrap_err(),
        port.device_mut().poll_modem_status().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
    assert!(!port.device().is_open());
}

#[test]
fn disconnect_mid_read_returns_no_data() {
    let (mut port, sim) = open(ChipType::Ft232R);
    sim.set_max_payload_per_packet(2);
    sim.queue_rx(&[1, 2, 3, 4]);
    assert_eq!(port.uart_read_exact(1).unwrap(), [1]);

    sim.disconnect();
    // One byte is still buffered but the read needs more
    let err = port.uart_read_exact(3).unwrap_err();
    assert!(err.is_disconnect());
    assert_eq!(port.device().buffered(), 0);
}

#[test]
fn spi_flash_id_on_ft2232h() {
    let (mut port, sim) = open(ChipType::Ft2232H);
    port.set_mode(PortMode::Mpsse, 0).unwrap();
    let spi = SpiBus::new(&mut port, SpiConfig::new(SpiMode::Mode0, 6_000_000)).unwrap();
    assert_eq!(spi.clock_hz(), 6_000_000);

    sim.queue_input_bytes(&[0xEF, 0x40, 0x18], BitOrder::MsbFirst);
    let id = spi.write_read(&mut port, &[0x9F], 3).unwrap();
    assert_eq!(id, [0xEF, 0x40, 0x18]);
    // CS back at idle
    assert_eq!(port.pins().value & 0x08, 0x08);
}

#[test]
fn jtag_reads_idcode() {
    let (mut port, sim) = open(ChipType::Ft232H);
    port.set_mode(PortMode::Mpsse, 0).unwrap();
    let mut jtag = JtagBus::new(&mut port, JtagConfig::default()).unwrap();
    jtag.reset(&mut port).unwrap();
    assert_eq!(jtag.state(), TapState::Idle);

    let idcode: u32 = 0x0BA0_0477;
    let bits: Vec<bool> = (0..32).map(|i| idcode >> i & 1 != 0).collect();
    sim.queue_input_bits(&bits);
    let out = jtag.shift_dr(&mut port, &[0; 4], 32).unwrap();
    assert_eq!(u32::from_le_bytes([out[0], out[1], out[2], out[3]]), idcode);
    assert_eq!(jtag.state(), TapState::Idle);
}

#[test]
fn mpsse_unavailable_on_second_ft4232h_pair() {
    init_logging();
    let sim = SimulatedChip::new(ChipType::Ft4232H);
    let mut port = Port::with_transport(sim, ChipType::Ft4232H, Interface::C, options()).unwrap();
    let err = port.set_mode(PortMode::Mpsse, 0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedConfig);
    assert_eq!(port.mode(), PortMode::Reset);
    port.set_mode(PortMode::AsyncBitbang, 0xFF).unwrap();
}

#[test]
fn disconnect_reported_before_mode_checks() {
    let (mut port, sim) = open(ChipType::Ft232H);
    port.set_mode(PortMode::Mpsse, 0).unwrap();

    sim.disconnect();
    // The switch dies half-way and leaves the port in Reset
    let err = port.set_mode(PortMode::SyncBitbang, 0xFF).unwrap_err();
    assert!(err.is_disconnect());
    assert_eq!(port.mode(), PortMode::Reset);

    let cfg = SpiMode::Mode0.shift_config(BitOrder::MsbFirst);
    for err in [
        port.shift_bytes(&[0xAA], cfg).unwrap_err(),
        port.set_clock(1_000_000).unwrap_err(),
        port.write_pins(0x01).unwrap_err(),
        port.read_pins().unwrap_err(),
        port.exchange(&[0x01]).unwrap_err(),
        port.set_baudrate(115_200).unwrap_err(),
        port.uart_write(b"x").unwrap_err(),
        port.uart_read_exact(1).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Transport, "{err}");
        assert!(err.is_disconnect());
    }
}

#[test]
fn uart_and_bitbang_refused_in_mpsse() {
    let (mut port, sim) = open(ChipType::Ft2232H);
    port.set_mode(PortMode::Mpsse, 0).unwrap();
    sim.clear_bulk_log();

    for err in [
        port.set_baudrate(9600).unwrap_err(),
        port.configure_uart(&UartConfig::new(9600)).unwrap_err(),
        port.uart_write(b"AT\r").unwrap_err(),
        port.uart_read_exact(1).unwrap_err(),
        port.write_pins(0x55).unwrap_err(),
        port.read_pins().unwrap_err(),
        port.exchange(&[0x55]).unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::ProtocolState, "{err}");
    }
    // Nothing reached the engine
    assert!(sim.bulk_log().is_empty());
    assert_eq!(port.mode(), PortMode::Mpsse);
}

#[test]
fn modem_status_polled_and_seen_in_frames() {
    let (mut port, sim) = open(ChipType::Ft232R);
    let status = port.device_mut().poll_modem_status().unwrap();
    assert!(!status.cts());

    // CTS and DSR raised
    sim.set_modem_status(0x31);
    let status = port.device_mut().poll_modem_status().unwrap();
    assert!(status.cts());
    assert!(status.dsr());
    assert!(!status.ri());

    sim.queue_rx(b"ok");
    assert_eq!(port.uart_read_exact(2).unwrap(), b"ok");
    let last = port.device().last_status().unwrap();
    assert!(last.cts());
    assert!(!last.framing_error());
}
