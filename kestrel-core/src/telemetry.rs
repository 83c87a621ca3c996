//! Vendor telemetry carried in `user_data_unregistered` SEI messages.
//!
//! Every payload starts with a 16-byte UUID naming its schema; the rest is a
//! packed sequence of network-byte-order integers, fixed-point coordinates
//! and angles, and zero-terminated serial-number halves. The assembler only
//! consumes the streaming schema's slice map (its concealment oracle); the
//! other schemas are decoded here for consumers and otherwise passed through
//! opaquely.

use bytes::Buf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Telemetry payload ended early: {0}")]
    UnexpectedEnd(#[from] bytes::TryGetError),

    #[error("Payload UUID does not match the requested schema")]
    UuidMismatch,

    #[error("Slice count {0} exceeds the supported maximum")]
    SliceCountTooLarge(u8),
}

/// Known schemas, identified by the leading UUID of the SEI payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryKind {
    BasicV1,
    BasicV2,
    ExtendedV1,
    ExtendedV2,
    FrameInfoV1,
    StreamingV1,
    StreamingFrameInfoV1,
    Unknown,
}

pub const UUID_BASIC_V1: [u8; 16] = [
    0x88, 0x18, 0xb6, 0xd5, 0x4a, 0xff, 0x45, 0xad, 0xba, 0x04, 0xbc, 0x0c, 0xba, 0xe6, 0xa5, 0xfd,
];
pub const UUID_BASIC_V2: [u8; 16] = [
    0xf1, 0x43, 0x3a, 0x75, 0xe4, 0x91, 0x4b, 0xf5, 0xaa, 0xdf, 0x45, 0x5d, 0xdf, 0x6a, 0xc0, 0xa8,
];
pub const UUID_EXTENDED_V1: [u8; 16] = [
    0x5a, 0xac, 0xe9, 0x27, 0x93, 0x3f, 0x41, 0xff, 0xb8, 0x63, 0xaf, 0x7e, 0x61, 0x75, 0x32, 0xcf,
];
pub const UUID_EXTENDED_V2: [u8; 16] = [
    0x93, 0x7a, 0x50, 0x9b, 0x2f, 0x23, 0x4d, 0xf6, 0x8b, 0xe3, 0x33, 0x05, 0x69, 0xd3, 0xb5, 0xbb,
];
pub const UUID_FRAMEINFO_V1: [u8; 16] = [
    0x39, 0x91, 0xd0, 0xdf, 0x5a, 0xdf, 0x46, 0xec, 0xbd, 0x68, 0xa7, 0x09, 0x6b, 0xb0, 0x29, 0xa8,
];
pub const UUID_STREAMING_V1: [u8; 16] = [
    0x13, 0xdb, 0xcc, 0xc7, 0xc7, 0x20, 0x42, 0xf5, 0xa0, 0xb7, 0xaa, 0xfa, 0xa2, 0xb3, 0xaf, 0x97,
];
pub const UUID_STREAMING_FRAMEINFO_V1: [u8; 16] = [
    0xa9, 0x0f, 0x27, 0x08, 0xdc, 0x10, 0x49, 0x3a, 0x9a, 0x34, 0x94, 0xb6, 0xb9, 0xba, 0xb7, 0x5b,
];

/// Largest slice count the streaming schema may carry.
pub const STREAMING_MAX_SLICE_COUNT: u8 = 128;

/// Length of each zero-terminated serial-number half, terminator excluded.
pub const SERIAL_NUMBER_PART_LENGTH: usize = 9;

/// Classifies a payload by its leading UUID.
pub fn kind_of(payload: &[u8]) -> TelemetryKind {
    let Some(uuid) = payload.get(..16) else {
        return TelemetryKind::Unknown;
    };
    if uuid == UUID_BASIC_V1 {
        TelemetryKind::BasicV1
    } else if uuid == UUID_BASIC_V2 {
        TelemetryKind::BasicV2
    } else if uuid == UUID_EXTENDED_V1 {
        TelemetryKind::ExtendedV1
    } else if uuid == UUID_EXTENDED_V2 {
        TelemetryKind::ExtendedV2
    } else if uuid == UUID_FRAMEINFO_V1 {
        TelemetryKind::FrameInfoV1
    } else if uuid == UUID_STREAMING_V1 {
        TelemetryKind::StreamingV1
    } else if uuid == UUID_STREAMING_FRAMEINFO_V1 {
        TelemetryKind::StreamingFrameInfoV1
    } else {
        TelemetryKind::Unknown
    }
}

/// Per-frame slice map, the concealment oracle of the assembler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamingInfo {
    pub index_in_gop: u8,
    pub slice_count: u8,
}

impl StreamingInfo {
    /// Deserializes the streaming schema from the bytes following its UUID.
    /// `slice_mb_count` receives the macroblock count of each slice.
    fn deserialize(
        mut buf: &[u8],
        slice_mb_count: &mut Vec<u16>,
    ) -> Result<Self, TelemetryError> {
        let info = StreamingInfo {
            index_in_gop: buf.try_get_u8()?,
            slice_count: buf.try_get_u8()?,
        };
        if info.slice_count > STREAMING_MAX_SLICE_COUNT {
            return Err(TelemetryError::SliceCountTooLarge(info.slice_count));
        }
        slice_mb_count.clear();
        for _ in 0..info.slice_count {
            slice_mb_count.push(buf.try_get_u16()?);
        }
        Ok(info)
    }
}

/// Extracts the streaming slice map if `payload` carries one, either
/// standalone or combined with frame info. `Ok(None)` means the payload is a
/// different (or unknown) schema.
pub fn parse_streaming_info(
    payload: &[u8],
    slice_mb_count: &mut Vec<u16>,
) -> Result<Option<StreamingInfo>, TelemetryError> {
    match kind_of(payload) {
        TelemetryKind::StreamingV1 => {
            StreamingInfo::deserialize(&payload[16..], slice_mb_count).map(Some)
        }
        TelemetryKind::StreamingFrameInfoV1 => {
            let streaming_offset = 16 + FrameInfoV1::PACKED_SIZE;
            // a payload shorter than the frame-info record fails through the
            // byte reader below
            let buf = payload.get(streaming_offset..).unwrap_or_default();
            StreamingInfo::deserialize(buf, slice_mb_count).map(Some)
        }
        _ => Ok(None),
    }
}

/// "Basic" v1 schema: frame index, acquisition timestamp, previous-frame MSE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicInfoV1 {
    pub frame_index: u32,
    pub acquisition_ts: u64,
    pub prev_mse_fp8: u32,
}

impl BasicInfoV1 {
    pub fn deserialize(payload: &[u8]) -> Result<Self, TelemetryError> {
        if kind_of(payload) != TelemetryKind::BasicV1 {
            return Err(TelemetryError::UuidMismatch);
        }
        let mut buf = &payload[16..];
        Ok(Self {
            frame_index: buf.try_get_u32()?,
            acquisition_ts: {
                let high = buf.try_get_u32()?;
                let low = buf.try_get_u32()?;
                (u64::from(high) << 32) | u64::from(low)
            },
            prev_mse_fp8: buf.try_get_u32()?,
        })
    }
}

/// "Basic" v2 schema: frame index and acquisition timestamp only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicInfoV2 {
    pub frame_index: u32,
    pub acquisition_ts: u64,
}

impl BasicInfoV2 {
    pub fn deserialize(payload: &[u8]) -> Result<Self, TelemetryError> {
        if kind_of(payload) != TelemetryKind::BasicV2 {
            return Err(TelemetryError::UuidMismatch);
        }
        let mut buf = &payload[16..];
        Ok(Self {
            frame_index: buf.try_get_u32()?,
            acquisition_ts: {
                let high = buf.try_get_u32()?;
                let low = buf.try_get_u32()?;
                (u64::from(high) << 32) | u64::from(low)
            },
        })
    }
}

/// "Frame info" v1 schema: the full flight/link/encoder telemetry record.
///
/// Angles and coordinates are fixed-point; the `_fp20`/`_fp16`/`_fp8`
/// suffixes carry the fractional bit count.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInfoV1 {
    pub frame_index: u32,
    pub acquisition_ts: u64,
    pub system_ts: u64,
    pub battery_percentage: u32,
    pub gps_latitude_fp20: i32,
    pub gps_longitude_fp20: i32,
    pub gps_altitude_fp16: i32,
    pub absolute_height_fp16: i32,
    pub relative_height_fp16: i32,
    pub x_speed_fp16: i32,
    pub y_speed_fp16: i32,
    pub z_speed_fp16: i32,
    pub distance_from_home_fp16: u32,
    pub yaw_fp16: i32,
    pub pitch_fp16: i32,
    pub roll_fp16: i32,
    pub camera_pan_fp16: i32,
    pub camera_tilt_fp16: i32,
    pub wifi_rssi: i32,
    pub wifi_mcs_rate: u32,
    pub wifi_tx_rate: u32,
    pub wifi_rx_rate: u32,
    pub wifi_tx_fail_rate: u32,
    pub wifi_tx_error_rate: u32,
    pub wifi_tx_fail_event_count: u32,
    pub video_streaming_target_bitrate: u32,
    pub video_streaming_decimation: u32,
    pub video_streaming_gop_length: u32,
    pub video_streaming_prev_frame_type: i32,
    pub video_streaming_prev_frame_size: u32,
    pub video_streaming_prev_frame_mse_y_fp8: u32,
    pub video_recording_prev_frame_type: i32,
    pub video_recording_prev_frame_size: u32,
    pub video_recording_prev_frame_mse_y_fp8: u32,
    pub streaming_monitor_time_interval: u32,
    pub streaming_mean_acq_to_network_time: u32,
    pub streaming_acq_to_network_jitter: u32,
    pub streaming_mean_network_time: u32,
    pub streaming_network_jitter: u32,
    pub streaming_bytes_sent: u32,
    pub streaming_mean_packet_size: u32,
    pub streaming_packet_size_std_dev: u32,
    pub streaming_packets_sent: u32,
    pub streaming_bytes_dropped: u32,
    pub streaming_nalu_dropped: u32,
    pub commands_max_time_delta_on_last_sec: u32,
    pub last_command_time_delta: u32,
    pub last_command_psi_value: u32,
    pub pre_reproj_timestamp_delta: u32,
    pub post_reproj_timestamp_delta: u32,
    pub post_ee_timestamp_delta: u32,
    pub post_scaling_timestamp_delta: u32,
    pub post_streaming_encoding_timestamp_delta: u32,
    pub post_recording_encoding_timestamp_delta: u32,
    pub post_network_input_timestamp_delta: u32,
    pub serial_number_high: String,
    pub serial_number_low: String,
}

impl FrameInfoV1 {
    /// Wire size of the record, UUID excluded: 57 32-bit words plus the two
    /// zero-terminated serial halves.
    pub const PACKED_SIZE: usize = 57 * 4 + 2 * (SERIAL_NUMBER_PART_LENGTH + 1);

    pub fn deserialize(payload: &[u8]) -> Result<Self, TelemetryError> {
        if kind_of(payload) != TelemetryKind::FrameInfoV1 {
            return Err(TelemetryError::UuidMismatch);
        }
        Self::deserialize_packed(&payload[16..])
    }

    fn deserialize_packed(mut buf: &[u8]) -> Result<Self, TelemetryError> {
        let mut info = Self {
            frame_index: buf.try_get_u32()?,
            acquisition_ts: {
                let high = buf.try_get_u32()?;
                let low = buf.try_get_u32()?;
                (u64::from(high) << 32) | u64::from(low)
            },
            system_ts: {
                let high = buf.try_get_u32()?;
                let low = buf.try_get_u32()?;
                (u64::from(high) << 32) | u64::from(low)
            },
            battery_percentage: buf.try_get_u32()?,
            gps_latitude_fp20: buf.try_get_i32()?,
            gps_longitude_fp20: buf.try_get_i32()?,
            gps_altitude_fp16: buf.try_get_i32()?,
            absolute_height_fp16: buf.try_get_i32()?,
            relative_height_fp16: buf.try_get_i32()?,
            x_speed_fp16: buf.try_get_i32()?,
            y_speed_fp16: buf.try_get_i32()?,
            z_speed_fp16: buf.try_get_i32()?,
            distance_from_home_fp16: buf.try_get_u32()?,
            yaw_fp16: buf.try_get_i32()?,
            pitch_fp16: buf.try_get_i32()?,
            roll_fp16: buf.try_get_i32()?,
            camera_pan_fp16: buf.try_get_i32()?,
            camera_tilt_fp16: buf.try_get_i32()?,
            wifi_rssi: buf.try_get_i32()?,
            wifi_mcs_rate: buf.try_get_u32()?,
            wifi_tx_rate: buf.try_get_u32()?,
            wifi_rx_rate: buf.try_get_u32()?,
            wifi_tx_fail_rate: buf.try_get_u32()?,
            wifi_tx_error_rate: buf.try_get_u32()?,
            wifi_tx_fail_event_count: buf.try_get_u32()?,
            video_streaming_target_bitrate: buf.try_get_u32()?,
            video_streaming_decimation: buf.try_get_u32()?,
            video_streaming_gop_length: buf.try_get_u32()?,
            video_streaming_prev_frame_type: buf.try_get_i32()?,
            video_streaming_prev_frame_size: buf.try_get_u32()?,
            video_streaming_prev_frame_mse_y_fp8: buf.try_get_u32()?,
            video_recording_prev_frame_type: buf.try_get_i32()?,
            video_recording_prev_frame_size: buf.try_get_u32()?,
            video_recording_prev_frame_mse_y_fp8: buf.try_get_u32()?,
            streaming_monitor_time_interval: buf.try_get_u32()?,
            streaming_mean_acq_to_network_time: buf.try_get_u32()?,
            streaming_acq_to_network_jitter: buf.try_get_u32()?,
            streaming_mean_network_time: buf.try_get_u32()?,
            streaming_network_jitter: buf.try_get_u32()?,
            streaming_bytes_sent: buf.try_get_u32()?,
            streaming_mean_packet_size: buf.try_get_u32()?,
            streaming_packet_size_std_dev: buf.try_get_u32()?,
            streaming_packets_sent: buf.try_get_u32()?,
            streaming_bytes_dropped: buf.try_get_u32()?,
            streaming_nalu_dropped: buf.try_get_u32()?,
            commands_max_time_delta_on_last_sec: buf.try_get_u32()?,
            last_command_time_delta: buf.try_get_u32()?,
            last_command_psi_value: buf.try_get_u32()?,
            pre_reproj_timestamp_delta: buf.try_get_u32()?,
            post_reproj_timestamp_delta: buf.try_get_u32()?,
            post_ee_timestamp_delta: buf.try_get_u32()?,
            post_scaling_timestamp_delta: buf.try_get_u32()?,
            post_streaming_encoding_timestamp_delta: buf.try_get_u32()?,
            post_recording_encoding_timestamp_delta: buf.try_get_u32()?,
            post_network_input_timestamp_delta: buf.try_get_u32()?,
            ..Default::default()
        };
        info.serial_number_high = read_serial_part(&mut buf)?;
        info.serial_number_low = read_serial_part(&mut buf)?;
        Ok(info)
    }
}

fn read_serial_part(buf: &mut &[u8]) -> Result<String, TelemetryError> {
    let mut raw = [0u8; SERIAL_NUMBER_PART_LENGTH + 1];
    buf.try_copy_to_slice(&mut raw)?;
    let end = raw
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(SERIAL_NUMBER_PART_LENGTH);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}
