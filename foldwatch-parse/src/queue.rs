//! Decoder for the client's binary queue snapshot (`queue.dat`).
//!
//! The file is a fixed 7168-byte image: an 8-byte header, ten 712-byte slot
//! records forming a ring, and a small trailer. Integer fields within one
//! record mix little- and big-endian encodings, so every field is read through
//! the [`FieldSpec`] table below with explicit byte order rather than by
//! overlaying a struct on the buffer.

use chrono::{DateTime, Utc};
use foldwatch_common::types::UnitIdentity;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Total size of a queue snapshot.
pub const QUEUE_SIZE: usize = 7168;
/// Size of one slot record.
pub const SLOT_SIZE: usize = 712;
/// Number of slots in the ring.
pub const SLOT_COUNT: usize = 10;
/// Offset of the first slot record.
pub const SLOTS_OFFSET: usize = 8;
/// Offset of the trailer.
pub const TRAILER_OFFSET: usize = SLOTS_OFFSET + SLOT_COUNT * SLOT_SIZE;

/// 2000-01-01T00:00:00Z as a Unix timestamp.
const EPOCH_2000: i64 = 946_684_800;

/// Errors reading a queue snapshot. Any of these means "queue unavailable".
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to read queue {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("queue snapshot is {actual} bytes, expected {QUEUE_SIZE}")]
    Size { actual: usize },
}

/// How a field's bytes are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    U16Le,
    U32Le,
    /// Byte-reversed relative to the rest of the record.
    U32Be,
    F32Le,
    /// Seconds since 2000-01-01 UTC, little-endian; zero means unset.
    Epoch2000Le,
    /// Seconds since 2000-01-01 UTC, big-endian; zero means unset.
    Epoch2000Be,
    /// Seconds since 1970-01-01 UTC, little-endian; zero means unset.
    Epoch1970Le,
    /// IPv4 address stored last octet first.
    IpReversed,
    /// IPv4 address stored first octet first.
    IpInOrder,
    /// NUL-terminated, space-padded text.
    Text,
    /// Raw bytes rendered as uppercase hex.
    Hex,
}

/// Location and encoding of one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub offset: usize,
    pub width: usize,
    pub encoding: Encoding,
}

impl FieldSpec {
    pub const fn new(name: &'static str, offset: usize, width: usize, encoding: Encoding) -> Self {
        Self {
            name,
            offset,
            width,
            encoding,
        }
    }

    pub const fn end(&self) -> usize {
        self.offset + self.width
    }

    fn raw<'a>(&self, record: &'a [u8]) -> &'a [u8] {
        record.get(self.offset..self.end()).unwrap_or(&[])
    }

    fn read_u16(&self, record: &[u8]) -> u16 {
        u16::from_le_bytes(fixed(record, self.offset))
    }

    fn read_u32(&self, record: &[u8]) -> u32 {
        let bytes = fixed(record, self.offset);
        match self.encoding {
            Encoding::U32Be | Encoding::Epoch2000Be => u32::from_be_bytes(bytes),
            _ => u32::from_le_bytes(bytes),
        }
    }

    fn read_f32(&self, record: &[u8]) -> f32 {
        f32::from_le_bytes(fixed(record, self.offset))
    }

    fn read_time(&self, record: &[u8]) -> Option<DateTime<Utc>> {
        let secs = self.read_u32(record);
        if secs == 0 {
            return None;
        }
        let base = match self.encoding {
            Encoding::Epoch1970Le => 0,
            _ => EPOCH_2000,
        };
        DateTime::from_timestamp(base + i64::from(secs), 0)
    }

    fn read_ip(&self, record: &[u8]) -> String {
        let mut octets: [u8; 4] = fixed(record, self.offset);
        if self.encoding == Encoding::IpReversed {
            octets.reverse();
        }
        Ipv4Addr::from(octets).to_string()
    }

    fn read_text(&self, record: &[u8]) -> String {
        let raw = self.raw(record);
        let end = memchr::memchr(0, raw).unwrap_or(raw.len());
        String::from_utf8_lossy(raw.get(..end).unwrap_or(&[]))
            .trim_end()
            .to_string()
    }

    fn read_hex(&self, record: &[u8]) -> String {
        self.raw(record).iter().map(|b| format!("{b:02X}")).collect()
    }
}

/// Copy `N` bytes at `offset`; zeros when out of range.
fn fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    data.get(offset..offset + N)
        .and_then(|s| s.try_into().ok())
        .unwrap_or([0; N])
}

/// Header and trailer fields (offsets from the start of the file).
pub mod file_fields {
    use super::{Encoding::*, FieldSpec};

    pub const VERSION: FieldSpec = FieldSpec::new("version", 0, 4, U32Le);
    pub const CURRENT_INDEX: FieldSpec = FieldSpec::new("current_index", 4, 4, U32Le);
    pub const PERFORMANCE_FRACTION: FieldSpec =
        FieldSpec::new("performance_fraction", 7128, 4, F32Le);
    pub const PERFORMANCE_FRACTION_UNIT_WEIGHT: FieldSpec =
        FieldSpec::new("performance_fraction_unit_weight", 7132, 4, U32Le);
    pub const DOWNLOAD_RATE_AVERAGE: FieldSpec =
        FieldSpec::new("download_rate_average", 7136, 4, U32Le);
    pub const DOWNLOAD_RATE_UNIT_WEIGHT: FieldSpec =
        FieldSpec::new("download_rate_unit_weight", 7140, 4, U32Le);
    pub const UPLOAD_RATE_AVERAGE: FieldSpec =
        FieldSpec::new("upload_rate_average", 7144, 4, U32Le);
    pub const UPLOAD_RATE_UNIT_WEIGHT: FieldSpec =
        FieldSpec::new("upload_rate_unit_weight", 7148, 4, U32Le);
}

/// Slot record fields (offsets from the start of the slot).
pub mod slot_fields {
    use super::{Encoding::*, FieldSpec};

    pub const STATUS: FieldSpec = FieldSpec::new("status", 0, 4, U32Le);
    pub const SMP_CORES: FieldSpec = FieldSpec::new("smp_cores", 4, 4, U32Be);
    pub const BEGIN_TIME: FieldSpec = FieldSpec::new("begin_time", 8, 4, Epoch2000Le);
    pub const END_TIME: FieldSpec = FieldSpec::new("end_time", 16, 4, Epoch2000Le);
    pub const SERVER_IP_LEGACY: FieldSpec = FieldSpec::new("server_ip_legacy", 40, 4, IpReversed);
    pub const UPLOAD_STATUS: FieldSpec = FieldSpec::new("upload_status", 44, 4, U32Le);
    pub const CORE_DOWNLOAD_URL: FieldSpec = FieldSpec::new("core_download_url", 48, 128, Text);
    pub const CORE_NUMBER: FieldSpec = FieldSpec::new("core_number", 180, 4, U32Le);
    pub const WORK_UNIT_DATA_SIZE: FieldSpec =
        FieldSpec::new("work_unit_data_size", 188, 4, U32Le);
    pub const PROJECT: FieldSpec = FieldSpec::new("project", 208, 2, U16Le);
    pub const RUN: FieldSpec = FieldSpec::new("run", 210, 2, U16Le);
    pub const CLONE: FieldSpec = FieldSpec::new("clone", 212, 2, U16Le);
    pub const GEN: FieldSpec = FieldSpec::new("gen", 214, 2, U16Le);
    pub const PROJECT_ISSUED: FieldSpec = FieldSpec::new("project_issued", 216, 4, Epoch2000Le);
    pub const MACHINE_ID: FieldSpec = FieldSpec::new("machine_id", 256, 4, U32Le);
    pub const SERVER_IP: FieldSpec = FieldSpec::new("server_ip", 260, 4, IpInOrder);
    pub const SERVER_PORT: FieldSpec = FieldSpec::new("server_port", 264, 4, U32Le);
    pub const WORK_UNIT_TYPE: FieldSpec = FieldSpec::new("work_unit_type", 268, 64, Text);
    pub const USER_NAME: FieldSpec = FieldSpec::new("user_name", 332, 64, Text);
    pub const TEAM_NUMBER: FieldSpec = FieldSpec::new("team_number", 396, 64, Text);
    pub const USER_AND_MACHINE_ID: FieldSpec = FieldSpec::new("user_and_machine_id", 460, 8, Hex);
    pub const BENCHMARK: FieldSpec = FieldSpec::new("benchmark", 468, 4, U32Be);
    pub const CPU_TYPE: FieldSpec = FieldSpec::new("cpu_type", 476, 4, U32Be);
    pub const OS_TYPE: FieldSpec = FieldSpec::new("os_type", 480, 4, U32Be);
    pub const CPU_SPECIES: FieldSpec = FieldSpec::new("cpu_species", 484, 4, U32Be);
    pub const OS_SPECIES: FieldSpec = FieldSpec::new("os_species", 488, 4, U32Be);
    pub const EXPIRATION_SECONDS: FieldSpec = FieldSpec::new("expiration_seconds", 492, 4, U32Le);
    pub const ASSIGNMENT_INFO_PRESENT: FieldSpec =
        FieldSpec::new("assignment_info_present", 504, 4, U32Be);
    pub const ASSIGNMENT_TIMESTAMP: FieldSpec =
        FieldSpec::new("assignment_timestamp", 508, 4, Epoch2000Be);
    pub const ASSIGNMENT_CHECKSUM: FieldSpec = FieldSpec::new("assignment_checksum", 512, 8, Hex);
    pub const COLLECTION_SERVER_IP: FieldSpec =
        FieldSpec::new("collection_server_ip", 520, 4, IpInOrder);
    pub const LEGACY_BEGIN_TIME: FieldSpec =
        FieldSpec::new("legacy_begin_time", 528, 4, Epoch1970Le);
    pub const LEGACY_END_TIME: FieldSpec = FieldSpec::new("legacy_end_time", 532, 4, Epoch1970Le);
    pub const PACKET_SIZE_LIMIT: FieldSpec = FieldSpec::new("packet_size_limit", 536, 4, U32Le);
    pub const UPLOAD_FAILURES: FieldSpec = FieldSpec::new("upload_failures", 540, 4, U32Le);
    pub const WORK_UNIT_TAG: FieldSpec = FieldSpec::new("work_unit_tag", 544, 64, Text);
    pub const DUE_TIME: FieldSpec = FieldSpec::new("due_time", 608, 4, Epoch2000Le);
    pub const MEMORY_MB: FieldSpec = FieldSpec::new("memory_mb", 672, 4, U32Le);
    pub const FLOPS: FieldSpec = FieldSpec::new("flops", 692, 4, U32Be);
    pub const SLOT_NUMBER: FieldSpec = FieldSpec::new("slot_number", 696, 4, U32Le);

    /// Every decoded slot field, in offset order.
    pub const ALL: &[FieldSpec] = &[
        STATUS,
        SMP_CORES,
        BEGIN_TIME,
        END_TIME,
        SERVER_IP_LEGACY,
        UPLOAD_STATUS,
        CORE_DOWNLOAD_URL,
        CORE_NUMBER,
        WORK_UNIT_DATA_SIZE,
        PROJECT,
        RUN,
        CLONE,
        GEN,
        PROJECT_ISSUED,
        MACHINE_ID,
        SERVER_IP,
        SERVER_PORT,
        WORK_UNIT_TYPE,
        USER_NAME,
        TEAM_NUMBER,
        USER_AND_MACHINE_ID,
        BENCHMARK,
        CPU_TYPE,
        OS_TYPE,
        CPU_SPECIES,
        OS_SPECIES,
        EXPIRATION_SECONDS,
        ASSIGNMENT_INFO_PRESENT,
        ASSIGNMENT_TIMESTAMP,
        ASSIGNMENT_CHECKSUM,
        COLLECTION_SERVER_IP,
        LEGACY_BEGIN_TIME,
        LEGACY_END_TIME,
        PACKET_SIZE_LIMIT,
        UPLOAD_FAILURES,
        WORK_UNIT_TAG,
        DUE_TIME,
        MEMORY_MB,
        FLOPS,
        SLOT_NUMBER,
    ];
}

/// Interpreted slot status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueSlotStatus {
    #[default]
    Empty,
    Deleted,
    Finished,
    Garbage,
    FoldingNow,
    Queued,
    ReadyForUpload,
    Abandoned,
    FetchingFromServer,
}

impl QueueSlotStatus {
    /// Map a raw status code. `is_current` marks the ring's active slot.
    pub fn from_code(code: u32, project: u32, upload_status: u32, is_current: bool) -> Self {
        match code {
            0 if project == 0 => Self::Empty,
            0 if upload_status == 1 => Self::Finished,
            0 => Self::Deleted,
            1 if is_current => Self::FoldingNow,
            1 => Self::Queued,
            2 => Self::ReadyForUpload,
            3 => Self::Abandoned,
            4 => Self::FetchingFromServer,
            _ => Self::Garbage,
        }
    }

    /// Whether the slot's identity fields can be trusted.
    pub fn has_unit(self) -> bool {
        !matches!(
            self,
            Self::Empty | Self::Deleted | Self::Garbage | Self::Abandoned
        )
    }

    /// Whether the unit in this slot has finished processing.
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished | Self::ReadyForUpload)
    }
}

impl std::fmt::Display for QueueSlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Empty => "empty",
            Self::Deleted => "deleted",
            Self::Finished => "finished",
            Self::Garbage => "garbage",
            Self::FoldingNow => "folding now",
            Self::Queued => "queued",
            Self::ReadyForUpload => "ready for upload",
            Self::Abandoned => "abandoned",
            Self::FetchingFromServer => "fetching from server",
        };
        f.write_str(label)
    }
}

/// One decoded slot record.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueSlot {
    pub index: usize,
    pub status: QueueSlotStatus,
    pub status_code: u32,
    pub smp_cores: u32,
    pub begin_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub server_ip_legacy: String,
    pub upload_status: u32,
    pub core_download_url: String,
    /// Core id rendered as `0xNN`.
    pub core_number: String,
    pub work_unit_data_size: u32,
    /// Project/run/clone/gen; `None` when the project is zero.
    pub identity: Option<UnitIdentity>,
    pub project_issued: Option<DateTime<Utc>>,
    pub machine_id: u32,
    pub server_ip: String,
    pub server_port: u32,
    pub work_unit_type: String,
    pub user_name: String,
    pub team_number: u32,
    pub user_and_machine_id: String,
    /// User id with the machine id removed, as uppercase hex.
    pub user_id: String,
    pub benchmark: u32,
    pub cpu_type: u32,
    pub os_type: u32,
    pub cpu_species: u32,
    pub os_species: u32,
    pub expiration_seconds: u32,
    pub assignment_info_present: bool,
    pub assignment_timestamp: Option<DateTime<Utc>>,
    pub assignment_checksum: String,
    pub collection_server_ip: String,
    pub legacy_begin_time: Option<DateTime<Utc>>,
    pub legacy_end_time: Option<DateTime<Utc>>,
    pub packet_size_limit: u32,
    pub upload_failures: u32,
    pub work_unit_tag: String,
    pub due_time: Option<DateTime<Utc>>,
    pub memory_mb: u32,
    pub flops: u32,
    pub slot_number: u32,
}

impl QueueSlot {
    fn decode(index: usize, record: &[u8], current_index: u32) -> Self {
        use slot_fields as f;

        let status_code = f::STATUS.read_u32(record);
        let upload_status = f::UPLOAD_STATUS.read_u32(record);
        let project = u32::from(f::PROJECT.read_u16(record));
        let identity = UnitIdentity::known(
            project,
            u32::from(f::RUN.read_u16(record)),
            u32::from(f::CLONE.read_u16(record)),
            u32::from(f::GEN.read_u16(record)),
        );
        let is_current = u32::try_from(index).is_ok_and(|i| i == current_index);

        let machine_id = f::MACHINE_ID.read_u32(record);
        let uid_bytes: [u8; 8] = fixed(record, f::USER_AND_MACHINE_ID.offset);
        let user_id = format!(
            "{:X}",
            u64::from_be_bytes(uid_bytes).wrapping_sub(u64::from(machine_id))
        );

        Self {
            index,
            status: QueueSlotStatus::from_code(status_code, project, upload_status, is_current),
            status_code,
            smp_cores: f::SMP_CORES.read_u32(record),
            begin_time: f::BEGIN_TIME.read_time(record),
            end_time: f::END_TIME.read_time(record),
            server_ip_legacy: f::SERVER_IP_LEGACY.read_ip(record),
            upload_status,
            core_download_url: f::CORE_DOWNLOAD_URL.read_text(record),
            core_number: format!("0x{:02X}", f::CORE_NUMBER.read_u32(record)),
            work_unit_data_size: f::WORK_UNIT_DATA_SIZE.read_u32(record),
            identity,
            project_issued: f::PROJECT_ISSUED.read_time(record),
            machine_id,
            server_ip: f::SERVER_IP.read_ip(record),
            server_port: f::SERVER_PORT.read_u32(record),
            work_unit_type: f::WORK_UNIT_TYPE.read_text(record),
            user_name: f::USER_NAME.read_text(record),
            team_number: f::TEAM_NUMBER.read_text(record).trim().parse().unwrap_or(0),
            user_and_machine_id: f::USER_AND_MACHINE_ID.read_hex(record),
            user_id,
            benchmark: f::BENCHMARK.read_u32(record),
            cpu_type: f::CPU_TYPE.read_u32(record),
            os_type: f::OS_TYPE.read_u32(record),
            cpu_species: f::CPU_SPECIES.read_u32(record),
            os_species: f::OS_SPECIES.read_u32(record),
            expiration_seconds: f::EXPIRATION_SECONDS.read_u32(record),
            assignment_info_present: f::ASSIGNMENT_INFO_PRESENT.read_u32(record) != 0,
            assignment_timestamp: f::ASSIGNMENT_TIMESTAMP.read_time(record),
            assignment_checksum: f::ASSIGNMENT_CHECKSUM.read_hex(record),
            collection_server_ip: f::COLLECTION_SERVER_IP.read_ip(record),
            legacy_begin_time: f::LEGACY_BEGIN_TIME.read_time(record),
            legacy_end_time: f::LEGACY_END_TIME.read_time(record),
            packet_size_limit: f::PACKET_SIZE_LIMIT.read_u32(record),
            upload_failures: f::UPLOAD_FAILURES.read_u32(record),
            work_unit_tag: f::WORK_UNIT_TAG.read_text(record),
            due_time: f::DUE_TIME.read_time(record),
            memory_mb: f::MEMORY_MB.read_u32(record),
            flops: f::FLOPS.read_u32(record),
            slot_number: f::SLOT_NUMBER.read_u32(record),
        }
    }

    /// Identity, but only when the status says the slot holds a unit.
    pub fn unit_identity(&self) -> Option<UnitIdentity> {
        self.identity.filter(|_| self.status.has_unit())
    }
}

/// Rolling averages kept after the last slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueTrailer {
    pub performance_fraction: f32,
    pub performance_fraction_unit_weight: u32,
    pub download_rate_average: u32,
    pub download_rate_unit_weight: u32,
    pub upload_rate_average: u32,
    pub upload_rate_unit_weight: u32,
}

/// A fully decoded queue snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueSnapshot {
    pub version: u32,
    /// Active slot as stored; may be out of range.
    pub current_index: u32,
    pub slots: [QueueSlot; SLOT_COUNT],
    pub trailer: QueueTrailer,
}

impl QueueSnapshot {
    /// Active slot index folded into the ring.
    pub fn active_index(&self) -> usize {
        self.current_index as usize % SLOT_COUNT
    }

    pub fn active_slot(&self) -> &QueueSlot {
        &self.slots[self.active_index()]
    }
}

/// Decode an in-memory queue snapshot.
pub fn decode_queue(bytes: &[u8]) -> Result<QueueSnapshot, QueueError> {
    if bytes.len() != QUEUE_SIZE {
        return Err(QueueError::Size {
            actual: bytes.len(),
        });
    }

    let version = file_fields::VERSION.read_u32(bytes);
    let current_index = file_fields::CURRENT_INDEX.read_u32(bytes);

    let slots = std::array::from_fn(|index| {
        let start = SLOTS_OFFSET + index * SLOT_SIZE;
        let record = bytes.get(start..start + SLOT_SIZE).unwrap_or(&[]);
        QueueSlot::decode(index, record, current_index)
    });

    let trailer = QueueTrailer {
        performance_fraction: file_fields::PERFORMANCE_FRACTION.read_f32(bytes),
        performance_fraction_unit_weight: file_fields::PERFORMANCE_FRACTION_UNIT_WEIGHT
            .read_u32(bytes),
        download_rate_average: file_fields::DOWNLOAD_RATE_AVERAGE.read_u32(bytes),
        download_rate_unit_weight: file_fields::DOWNLOAD_RATE_UNIT_WEIGHT.read_u32(bytes),
        upload_rate_average: file_fields::UPLOAD_RATE_AVERAGE.read_u32(bytes),
        upload_rate_unit_weight: file_fields::UPLOAD_RATE_UNIT_WEIGHT.read_u32(bytes),
    };

    Ok(QueueSnapshot {
        version,
        current_index,
        slots,
        trailer,
    })
}

/// Read and decode a queue snapshot file.
pub fn read_queue_file(path: &Path) -> Result<QueueSnapshot, QueueError> {
    let bytes = std::fs::read(path).map_err(|source| QueueError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let snapshot = decode_queue(&bytes)?;
    debug!(
        path = %path.display(),
        version = snapshot.version,
        current_index = snapshot.current_index,
        "Decoded queue snapshot"
    );
    Ok(snapshot)
}
