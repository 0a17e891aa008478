use core::{fmt::Write, sync::atomic::Ordering};

use embassy_futures::select::{select, Either};
use embassy_time::{with_timeout, Duration};
use esp_hal::uart::Config as UartConfig;
use heapless::String;
use maitouch::touch::aggregate::{area_name, Edge};

use super::{
    config::{
        BAUD_RATES, CONFIG_REQUESTS, LINE_BUF_LEN, SERIAL_READ_SLICE_MS, TOUCH_EVENTS,
        TOUCH_FRAMES, TOUCH_STATE_HI, TOUCH_STATE_LO,
    },
    telemetry,
    types::{ConfigRequest, PlayerSide, SerialUart},
};

const PACKET_LEN: usize = 8;
const FRAME_LEN: usize = 10;

const CMD_RESET: u8 = b'E';
const CMD_HALT: u8 = b'L';
const CMD_STAT: u8 = b'A';
const CMD_RATIO: u8 = b'r';
const CMD_SENS: u8 = b'k';
const CMD_BAUD: u8 = b'U';

const HELP_TEXT: &[u8] = b"commands:\r\n\
  {<L|R> <sensor> <cmd> <value> . .}  E reset | L halt | A stream | r ratio | k sensitivity | U baud 0-6\r\n\
  /help     this text\r\n\
  /metrics  counter dump\r\n";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
struct CommandPacket {
    lr: u8,
    sensor: u8,
    cmd: u8,
    value: u8,
}

/// Sliding window over the byte stream; the host frames commands as
/// exactly eight bytes `{` lr sensor cmd value pad pad `}`.
struct PacketWindow {
    buf: [u8; PACKET_LEN],
    len: usize,
}

impl PacketWindow {
    const fn new() -> Self {
        Self {
            buf: [0; PACKET_LEN],
            len: 0,
        }
    }

    fn push(&mut self, byte: u8) -> Option<CommandPacket> {
        if self.len == PACKET_LEN {
            self.buf.copy_within(1.., 0);
            self.len -= 1;
        }
        self.buf[self.len] = byte;
        self.len += 1;

        if self.len == PACKET_LEN && self.buf[0] == b'{' && self.buf[PACKET_LEN - 1] == b'}' {
            let packet = CommandPacket {
                lr: self.buf[1],
                sensor: self.buf[2],
                cmd: self.buf[3],
                value: self.buf[4],
            };
            self.len = 0;
            return Some(packet);
        }
        None
    }
}

/// Packs the 40-bit state into the wire frame: byte *i* carries state
/// bits `5i..5i+4`.
fn touch_frame(state: u64) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = b'(';
    frame[FRAME_LEN - 1] = b')';
    for slot in 0..8 {
        frame[1 + slot] = ((state >> (5 * slot)) & 0x1F) as u8;
    }
    frame
}

fn baud_for(value: u8) -> Option<(u8, u32)> {
    let select = value.checked_sub(b'0')?;
    BAUD_RATES.get(select as usize).map(|&baud| (select, baud))
}

#[embassy_executor::task]
pub(crate) async fn serial_protocol_task(mut uart: SerialUart, side: PlayerSide) {
    let mut window = PacketWindow::new();
    let mut line_buf = [0u8; LINE_BUF_LEN];
    let mut line_len = 0usize;
    let mut rx = [0u8; 1];
    let mut streaming = false;

    loop {
        while let Ok(event) = TOUCH_EVENTS.try_receive() {
            if !streaming {
                let verb = match event.edge {
                    Edge::Press => "press",
                    Edge::Release => "release",
                };
                esp_println::println!("touch: {} {}", verb, area_name(event.point));
            }
        }

        let read = with_timeout(
            Duration::from_millis(SERIAL_READ_SLICE_MS),
            uart.read_async(&mut rx),
        );
        match select(read, TOUCH_FRAMES.receive()).await {
            Either::First(Ok(Ok(1))) => {
                let byte = rx[0];
                if let Some(packet) = window.push(byte) {
                    telemetry::record_serial_command();
                    handle_packet(&mut uart, packet, side, &mut streaming).await;
                }
                handle_line_byte(&mut uart, &mut line_buf, &mut line_len, byte).await;
            }
            Either::First(_) => {}
            Either::Second(state) => {
                // Stale frames drain here while halted so the channel
                // never backs up against the pipeline.
                if streaming {
                    let frame = touch_frame(state);
                    if uart_write_all(&mut uart, &frame).await {
                        telemetry::record_frame_streamed();
                    }
                }
            }
        }
    }
}

async fn handle_packet(
    uart: &mut SerialUart,
    packet: CommandPacket,
    side: PlayerSide,
    streaming: &mut bool,
) {
    if packet.lr != side.letter() {
        return;
    }
    match packet.cmd {
        CMD_RESET | CMD_HALT => {
            *streaming = false;
            CONFIG_REQUESTS.send(ConfigRequest::SetLeds(false)).await;
        }
        CMD_STAT => {
            CONFIG_REQUESTS.send(ConfigRequest::Persist).await;
            CONFIG_REQUESTS.send(ConfigRequest::SetLeds(true)).await;
            *streaming = true;
        }
        CMD_RATIO => {
            let reply = [
                b'(',
                side.letter(),
                packet.sensor,
                CMD_RATIO,
                packet.value,
                b')',
            ];
            let _ = uart_write_all(uart, &reply).await;
        }
        CMD_SENS => {
            let value = packet.value.min(99);
            let request = if packet.sensor == 0 {
                ConfigRequest::AllSensitivity { value }
            } else {
                ConfigRequest::PointSensitivity {
                    point: packet.sensor,
                    value,
                }
            };
            CONFIG_REQUESTS.send(request).await;
            let reply = [b'(', b'R', packet.sensor, CMD_SENS, value, b')'];
            let _ = uart_write_all(uart, &reply).await;
        }
        CMD_BAUD => {
            if let Some((select, baud)) = baud_for(packet.value) {
                let config = UartConfig::default().with_baudrate(baud);
                if uart.apply_config(&config).is_ok() {
                    CONFIG_REQUESTS
                        .send(ConfigRequest::BaudSelect(select))
                        .await;
                    esp_println::println!("serial: baud {}", baud);
                }
            }
        }
        _ => {}
    }
}

async fn handle_line_byte(
    uart: &mut SerialUart,
    line_buf: &mut [u8; LINE_BUF_LEN],
    line_len: &mut usize,
    byte: u8,
) {
    if byte == b'\r' || byte == b'\n' {
        if *line_len > 0 {
            let line = &line_buf[..*line_len];
            if line == b"/help" {
                let _ = uart_write_all(uart, HELP_TEXT).await;
            } else if line == b"/metrics" {
                write_metrics(uart).await;
            }
            *line_len = 0;
        }
        return;
    }
    if *line_len < LINE_BUF_LEN {
        line_buf[*line_len] = byte;
        *line_len += 1;
    } else {
        *line_len = 0;
    }
}

async fn write_metrics(uart: &mut SerialUart) {
    let snapshot = telemetry::snapshot();
    let state = ((TOUCH_STATE_HI.load(Ordering::Relaxed) as u64) << 32)
        | TOUCH_STATE_LO.load(Ordering::Relaxed) as u64;
    let mut line = String::<192>::new();
    let _ = write!(
        &mut line,
        "METRICS FRAMES={} FAILURES={} APPLIED={} CAL_DONE={} COMMANDS={} STREAMED={} STATE={:010x}\r\n",
        snapshot.frames,
        snapshot.sample_failures,
        snapshot.pending_applies,
        snapshot.calibrations_done,
        snapshot.serial_commands,
        snapshot.frames_streamed,
        state,
    );
    let _ = uart_write_all(uart, line.as_bytes()).await;
}

async fn uart_write_all(uart: &mut SerialUart, mut bytes: &[u8]) -> bool {
    while !bytes.is_empty() {
        match uart.write_async(bytes).await {
            Ok(0) => return false,
            Ok(written) => bytes = &bytes[written..],
            Err(_) => return false,
        }
    }
    true
}
