use crate::{
    error::{BmsError, Result},
    telemetry::{charge_percentage, classify, round2},
    types::{BatteryReading, Track, MAX_CELLS_PER_TRACK},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame start marker
pub const START_MARKER: u8 = 0xDD;

/// Frame type marker for a read request
pub const READ_MARKER: u8 = 0xA5;

/// Basic pack information command
pub const CMD_BASIC_INFO: u8 = 0x03;

/// Frame end marker
pub const END_MARKER: u8 = 0x77;

/// Checksum slot of the read command
///
/// Sent verbatim on every request. The vendor accepts this fixed value and it
/// is not recomputed per call.
pub const COMMAND_PLACEHOLDER: [u8; 2] = [0xFF, 0xFD];

/// Complete read command, identical for every poll of every device
pub const READ_COMMAND: [u8; 7] = [
    START_MARKER,
    READ_MARKER,
    CMD_BASIC_INFO,
    0x00,
    COMMAND_PLACEHOLDER[0],
    COMMAND_PLACEHOLDER[1],
    END_MARKER,
];

/// Minimum length of a telemetry frame in bytes
pub const MIN_FRAME_LEN: usize = 34;

/// Pack current, big-endian i16, 10 mA units
pub const CURRENT_OFFSET: usize = 2;

/// First cell voltage, big-endian u16 per cell, mV
pub const CELL_VOLTAGE_OFFSET: usize = 6;

/// Pack temperature, big-endian i16, 0.1 °C units
pub const TEMPERATURE_OFFSET: usize = 23;

/// Number of cells reported by the BMS
pub const CELL_COUNT_OFFSET: usize = 25;

/// Build the outgoing read command
#[must_use]
pub fn read_command() -> Bytes {
    let mut buf = BytesMut::with_capacity(READ_COMMAND.len());

    buf.put_u8(START_MARKER);
    buf.put_u8(READ_MARKER);
    buf.put_u8(CMD_BASIC_INFO);
    // no payload
    buf.put_u8(0x00);
    buf.put_slice(&COMMAND_PLACEHOLDER);
    buf.put_u8(END_MARKER);

    buf.freeze()
}

/// Decode a telemetry frame into per-cell readings for one track
///
/// Cells reported beyond `cells_per_track` are ignored. Only the magnitude of
/// the pack current is kept.
///
/// # Errors
///
/// Returns [`BmsError::InvalidConfig`] if `cells_per_track` exceeds
/// [`MAX_CELLS_PER_TRACK`], [`BmsError::FrameTooShort`] for frames under
/// [`MIN_FRAME_LEN`] bytes and [`BmsError::FrameParseError`] when a field lies
/// outside the frame.
pub fn decode_frame(
    frame: &[u8],
    track: Track,
    cells_per_track: u8,
) -> Result<Vec<BatteryReading>> {
    if cells_per_track > MAX_CELLS_PER_TRACK {
        return Err(BmsError::InvalidConfig(format!(
            "{cells_per_track} cells per track overflows battery numbering"
        )));
    }
    if frame.len() < MIN_FRAME_LEN {
        return Err(BmsError::FrameTooShort { len: frame.len() });
    }

    let reported_cells = frame[CELL_COUNT_OFFSET];
    let cell_count = reported_cells.min(cells_per_track);

    let raw_current = read_i16(frame, CURRENT_OFFSET, "pack current")?;
    let amperage = round2((f64::from(raw_current) / 100.0).abs());

    let raw_temperature = read_i16(frame, TEMPERATURE_OFFSET, "temperature")?;
    #[allow(clippy::cast_possible_truncation)]
    let temperature = (f64::from(raw_temperature) / 10.0).round() as i32;

    let mut readings = Vec::with_capacity(usize::from(cell_count));
    for i in 0..cell_count {
        let offset = CELL_VOLTAGE_OFFSET + 2 * usize::from(i);
        let millivolts = read_u16(frame, offset, "cell voltage")?;
        let voltage = f64::from(millivolts) / 1000.0;
        let position = i + 1;

        readings.push(BatteryReading {
            battery_number: track.global_index(cells_per_track, position),
            track,
            track_position: position,
            voltage: round2(voltage),
            amperage,
            temperature,
            charge_level: charge_percentage(voltage),
            status: classify(voltage),
        });
    }

    Ok(readings)
}

fn field<'a>(frame: &'a [u8], offset: usize, name: &str) -> Result<&'a [u8]> {
    frame.get(offset..offset + 2).ok_or_else(|| {
        BmsError::FrameParseError(format!(
            "{name} at offset {offset} lies beyond {}-byte frame",
            frame.len()
        ))
    })
}

fn read_u16(frame: &[u8], offset: usize, name: &str) -> Result<u16> {
    let mut buf = field(frame, offset, name)?;
    Ok(buf.get_u16())
}

fn read_i16(frame: &[u8], offset: usize, name: &str) -> Result<i16> {
    let mut buf = field(frame, offset, name)?;
    Ok(buf.get_i16())
}
