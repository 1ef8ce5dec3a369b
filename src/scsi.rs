//! SCSI block device trait and command handling
//!
//! This module defines the interface that storage backends must implement
//! and handles SCSI command processing per the SCSI Block Commands (SBC) specification.

use crate::error::{IscsiError, ScsiResult};
use byteorder::{BigEndian, ByteOrder};
use std::collections::HashMap;
use std::sync::Mutex;

/// SCSI block device trait
///
/// Implement this trait to provide storage backend for the iSCSI target.
/// The trait is designed to be simple and focused on block-level operations.
pub trait ScsiBlockDevice: Send + Sync {
    /// Read blocks from the device
    ///
    /// # Arguments
    /// * `lba` - Logical block address to start reading from
    /// * `blocks` - Number of blocks to read
    /// * `block_size` - Size of each block in bytes
    ///
    /// # Returns
    /// Vector containing the requested data (length = blocks * block_size)
    fn read(&self, lba: u64, blocks: u32, block_size: u32) -> ScsiResult<Vec<u8>>;

    /// Write blocks to the device
    ///
    /// # Arguments
    /// * `lba` - Logical block address to start writing to
    /// * `data` - Data to write (length must be multiple of block_size)
    /// * `block_size` - Size of each block in bytes
    fn write(&mut self, lba: u64, data: &[u8], block_size: u32) -> ScsiResult<()>;

    /// Get total capacity in logical blocks
    fn capacity(&self) -> u64;

    /// Get block size in bytes (typically 512 or 4096)
    fn block_size(&self) -> u32;

    /// Flush any pending writes to stable storage
    fn flush(&mut self) -> ScsiResult<()> {
        // Default implementation: no-op
        Ok(())
    }

    /// Get vendor identification (8 chars max)
    fn vendor_id(&self) -> &str {
        "ISCSI   "
    }

    /// Get product identification (16 chars max)
    fn product_id(&self) -> &str {
        "Virtual Disk    "
    }

    /// Get product revision (4 chars max)
    fn product_rev(&self) -> &str {
        "1.0 "
    }
}

/// SCSI command opcodes (subset needed for basic block storage)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScsiOpcode {
    TestUnitReady = 0x00,
    Read6 = 0x08,
    Write6 = 0x0A,
    RequestSense = 0x03,
    Inquiry = 0x12,
    ModeSense6 = 0x1A,
    StartStopUnit = 0x1B,
    ReadCapacity10 = 0x25,
    Read10 = 0x28,
    Write10 = 0x2A,
    Verify10 = 0x2F,
    SynchronizeCache10 = 0x35,
    ModeSense10 = 0x5A,
    PersistentReserveIn = 0x5E,
    PersistentReserveOut = 0x5F,
    Read16 = 0x88,
    Write16 = 0x8A,
    Verify16 = 0x8F,
    SynchronizeCache16 = 0x91,
    ServiceActionIn16 = 0x9E, // READ CAPACITY 16 uses this
    Reserve6 = 0x16,
    Release6 = 0x17,
    ReportLuns = 0xA0,
    Read12 = 0xA8,
    Write12 = 0xAA,
}

impl ScsiOpcode {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0x00 => Some(ScsiOpcode::TestUnitReady),
            0x03 => Some(ScsiOpcode::RequestSense),
            0x08 => Some(ScsiOpcode::Read6),
            0x0A => Some(ScsiOpcode::Write6),
            0x12 => Some(ScsiOpcode::Inquiry),
            0x16 => Some(ScsiOpcode::Reserve6),
            0x17 => Some(ScsiOpcode::Release6),
            0x1A => Some(ScsiOpcode::ModeSense6),
            0x1B => Some(ScsiOpcode::StartStopUnit),
            0x25 => Some(ScsiOpcode::ReadCapacity10),
            0x28 => Some(ScsiOpcode::Read10),
            0x2A => Some(ScsiOpcode::Write10),
            0x2F => Some(ScsiOpcode::Verify10),
            0x35 => Some(ScsiOpcode::SynchronizeCache10),
            0x5A => Some(ScsiOpcode::ModeSense10),
            0x5E => Some(ScsiOpcode::PersistentReserveIn),
            0x5F => Some(ScsiOpcode::PersistentReserveOut),
            0x88 => Some(ScsiOpcode::Read16),
            0x8A => Some(ScsiOpcode::Write16),
            0x8F => Some(ScsiOpcode::Verify16),
            0x91 => Some(ScsiOpcode::SynchronizeCache16),
            0x9E => Some(ScsiOpcode::ServiceActionIn16),
            0xA0 => Some(ScsiOpcode::ReportLuns),
            0xA8 => Some(ScsiOpcode::Read12),
            0xAA => Some(ScsiOpcode::Write12),
            _ => None,
        }
    }

    /// Whether this opcode is a media-access command subject to reservation
    /// conflict checking (RESERVE/RELEASE/PR themselves, and the handful of
    /// commands SPC exempts, are not).
    fn is_media_access(self) -> bool {
        matches!(
            self,
            ScsiOpcode::Read6
                | ScsiOpcode::Write6
                | ScsiOpcode::Read10
                | ScsiOpcode::Write10
                | ScsiOpcode::Read12
                | ScsiOpcode::Write12
                | ScsiOpcode::Read16
                | ScsiOpcode::Write16
                | ScsiOpcode::Verify10
                | ScsiOpcode::Verify16
                | ScsiOpcode::SynchronizeCache10
                | ScsiOpcode::SynchronizeCache16
                | ScsiOpcode::StartStopUnit
        )
    }
}

// Keep the old enum name for backwards compatibility
pub type ScsiCommand = ScsiOpcode;

/// SCSI status codes
pub mod scsi_status {
    pub const GOOD: u8 = 0x00;
    pub const CHECK_CONDITION: u8 = 0x02;
    pub const CONDITION_MET: u8 = 0x04;
    pub const BUSY: u8 = 0x08;
    pub const RESERVATION_CONFLICT: u8 = 0x18;
    pub const TASK_SET_FULL: u8 = 0x28;
    pub const ACA_ACTIVE: u8 = 0x30;
    pub const TASK_ABORTED: u8 = 0x40;
}

/// SCSI sense key codes
pub mod sense_key {
    pub const NO_SENSE: u8 = 0x00;
    pub const RECOVERED_ERROR: u8 = 0x01;
    pub const NOT_READY: u8 = 0x02;
    pub const MEDIUM_ERROR: u8 = 0x03;
    pub const HARDWARE_ERROR: u8 = 0x04;
    pub const ILLEGAL_REQUEST: u8 = 0x05;
    pub const UNIT_ATTENTION: u8 = 0x06;
    pub const DATA_PROTECT: u8 = 0x07;
    pub const BLANK_CHECK: u8 = 0x08;
    pub const ABORTED_COMMAND: u8 = 0x0B;
    pub const VOLUME_OVERFLOW: u8 = 0x0D;
    pub const MISCOMPARE: u8 = 0x0E;
}

/// Additional Sense Code (ASC) values
pub mod asc {
    pub const NO_ADDITIONAL_SENSE: u8 = 0x00;
    pub const INVALID_COMMAND_OPERATION_CODE: u8 = 0x20;
    pub const LBA_OUT_OF_RANGE: u8 = 0x21;
    pub const INVALID_FIELD_IN_CDB: u8 = 0x24;
    pub const LOGICAL_UNIT_NOT_SUPPORTED: u8 = 0x25;
    pub const WRITE_PROTECTED: u8 = 0x27;
    pub const POWER_ON_RESET: u8 = 0x29;
    pub const MEDIUM_NOT_PRESENT: u8 = 0x3A;
    pub const INTERNAL_TARGET_FAILURE: u8 = 0x44;
}

/// SCSI sense data (fixed format)
#[derive(Debug, Clone)]
pub struct SenseData {
    pub sense_key: u8,
    pub asc: u8,        // Additional Sense Code
    pub ascq: u8,       // Additional Sense Code Qualifier
    pub information: u32,
}

impl SenseData {
    pub fn new(sense_key: u8, asc: u8, ascq: u8) -> Self {
        SenseData {
            sense_key,
            asc,
            ascq,
            information: 0,
        }
    }

    pub fn with_info(mut self, info: u32) -> Self {
        self.information = info;
        self
    }

    /// Serialize to fixed format sense data (18 bytes)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = vec![0u8; 18];

        // Response code: 0x70 = current error, fixed format
        data[0] = 0x70;

        // Sense key
        data[2] = self.sense_key & 0x0F;

        // Information (4 bytes, big-endian)
        BigEndian::write_u32(&mut data[3..7], self.information);

        // Additional sense length
        data[7] = 10; // Remaining bytes after this field

        // ASC and ASCQ
        data[12] = self.asc;
        data[13] = self.ascq;

        data
    }

    /// Create sense data for invalid/unsupported command opcode
    pub fn invalid_command() -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::INVALID_COMMAND_OPERATION_CODE, 0)
    }

    /// Create sense data for LBA out of range
    pub fn lba_out_of_range(lba: u32) -> Self {
        SenseData::new(sense_key::ILLEGAL_REQUEST, asc::LBA_OUT_OF_RANGE, 0)
            .with_info(lba)
    }

    /// Create sense data for medium error
    pub fn medium_error() -> Self {
        SenseData::new(sense_key::MEDIUM_ERROR, 0x11, 0x00) // Unrecovered read error
    }

    /// Create sense data for write protected
    pub fn write_protected() -> Self {
        SenseData::new(sense_key::DATA_PROTECT, asc::WRITE_PROTECTED, 0)
    }

    /// Sense data meaning "nothing to report" (REQUEST SENSE with no prior
    /// CHECK CONDITION on this nexus).
    pub fn no_sense() -> Self {
        SenseData::new(sense_key::NO_SENSE, asc::NO_ADDITIONAL_SENSE, 0)
    }
}

/// Result of SCSI command execution
#[derive(Debug, Clone)]
pub struct ScsiResponse {
    /// SCSI status code
    pub status: u8,
    /// Response data (for read commands)
    pub data: Vec<u8>,
    /// Sense data (for CHECK CONDITION status)
    pub sense: Option<SenseData>,
}

impl ScsiResponse {
    /// Create a GOOD status response with data
    pub fn good(data: Vec<u8>) -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data,
            sense: None,
        }
    }

    /// Create a GOOD status response without data
    pub fn good_no_data() -> Self {
        ScsiResponse {
            status: scsi_status::GOOD,
            data: Vec::new(),
            sense: None,
        }
    }

    /// Create a CHECK CONDITION response with sense data
    pub fn check_condition(sense: SenseData) -> Self {
        ScsiResponse {
            status: scsi_status::CHECK_CONDITION,
            data: Vec::new(),
            sense: Some(sense),
        }
    }

    /// Create a RESERVATION CONFLICT response (no sense data, per SPC).
    pub fn reservation_conflict() -> Self {
        ScsiResponse {
            status: scsi_status::RESERVATION_CONFLICT,
            data: Vec::new(),
            sense: None,
        }
    }
}

/// Per-LU reservation state: the legacy RESERVE(6)/RELEASE(6) holder and the
/// SPC-3 persistent reservation registrant set (SPEC_FULL §3 `ReservationEntry`).
#[derive(Debug, Default)]
pub struct ReservationTable {
    /// I_T nexus key holding a legacy RESERVE(6) reservation, if any.
    pub legacy_holder: Option<String>,
    /// Reservation key -> registrant I_T nexus key.
    pub registrants: HashMap<u64, String>,
    /// Current persistent reservation: (reservation key, PR type).
    pub holder: Option<(u64, u8)>,
    /// Bumped on every state-changing PR OUT / RESERVE / RELEASE.
    pub generation: u32,
}

impl ReservationTable {
    /// Whether `initiator_key` would conflict with the current reservation
    /// (legacy or persistent) held by someone else.
    fn conflicts_with(&self, initiator_key: &str) -> bool {
        if let Some(ref holder) = self.legacy_holder {
            if holder != initiator_key {
                return true;
            }
        }
        if let Some((key, _pr_type)) = self.holder {
            if let Some(holder_nexus) = self.registrants.get(&key) {
                if holder_nexus != initiator_key {
                    return true;
                }
            }
        }
        false
    }
}

/// Per-I_T_L-nexus execution context threaded through `handle_command`:
/// identifies the caller for reservation checks and carries the nexus's
/// last sense data across a REQUEST SENSE round trip.
pub struct ScsiContext {
    /// Opaque key identifying the initiator session (I_T nexus) issuing the
    /// command, used for reservation-conflict and PR registrant bookkeeping.
    pub initiator_key: String,
    /// Sense data left behind by the most recent CHECK CONDITION on this
    /// nexus; REQUEST SENSE returns and clears it.
    pub last_sense: Option<SenseData>,
}

/// SCSI Command Handler
pub struct ScsiHandler;

impl ScsiHandler {
    /// Handle a SCSI command and return response
    pub fn handle_command(
        cdb: &[u8],
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
        reservation: &Mutex<ReservationTable>,
        ctx: &mut ScsiContext,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.is_empty() {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let opcode = cdb[0];
        let op = ScsiOpcode::from_u8(opcode);

        // Note: LUN validation is done at the target level since the LUN is in the PDU header,
        // not in the CDB. The handler receives already-validated LUN.

        if let Some(op) = op {
            if op.is_media_access() {
                let table = reservation.lock().map_err(|_| {
                    IscsiError::InternalAssertionFailure("reservation mutex poisoned".into())
                })?;
                if table.conflicts_with(&ctx.initiator_key) {
                    return Ok(ScsiResponse::reservation_conflict());
                }
            }
        }

        let response = match op {
            Some(ScsiOpcode::TestUnitReady) => Self::handle_test_unit_ready(),
            Some(ScsiOpcode::Inquiry) => Self::handle_inquiry(cdb, &*device),
            Some(ScsiOpcode::ReadCapacity10) => Self::handle_read_capacity_10(&*device),
            Some(ScsiOpcode::ServiceActionIn16) => Self::handle_service_action_in_16(cdb, &*device),
            Some(ScsiOpcode::Read6) => Self::handle_read_6(cdb, &*device),
            Some(ScsiOpcode::Read10) => Self::handle_read_10(cdb, &*device),
            Some(ScsiOpcode::Read12) => Self::handle_read_12(cdb, &*device),
            Some(ScsiOpcode::Read16) => Self::handle_read_16(cdb, &*device),
            Some(ScsiOpcode::Write6) => Self::handle_write_6(cdb, device, write_data),
            Some(ScsiOpcode::Write10) => Self::handle_write_10(cdb, device, write_data),
            Some(ScsiOpcode::Write12) => Self::handle_write_12(cdb, device, write_data),
            Some(ScsiOpcode::Write16) => Self::handle_write_16(cdb, device, write_data),
            Some(ScsiOpcode::ModeSense6) => Self::handle_mode_sense_6(cdb, device.block_size()),
            Some(ScsiOpcode::ModeSense10) => Self::handle_mode_sense_10(cdb, device.block_size()),
            Some(ScsiOpcode::RequestSense) => Self::handle_request_sense(cdb, ctx),
            Some(ScsiOpcode::SynchronizeCache10) | Some(ScsiOpcode::SynchronizeCache16) => {
                Self::handle_synchronize_cache(device)
            }
            Some(ScsiOpcode::ReportLuns) => Self::handle_report_luns(cdb),
            Some(ScsiOpcode::StartStopUnit) => Self::handle_start_stop_unit(cdb),
            Some(ScsiOpcode::Verify10) | Some(ScsiOpcode::Verify16) => {
                // VERIFY without BYTCHK just checks the medium - always succeed
                Ok(ScsiResponse::good_no_data())
            }
            Some(ScsiOpcode::Reserve6) => Self::handle_reserve_6(reservation, &ctx.initiator_key),
            Some(ScsiOpcode::Release6) => Self::handle_release_6(reservation, &ctx.initiator_key),
            Some(ScsiOpcode::PersistentReserveIn) => Self::handle_pr_in(cdb, reservation),
            Some(ScsiOpcode::PersistentReserveOut) => {
                Self::handle_pr_out(cdb, write_data, reservation, &ctx.initiator_key)
            }
            None => {
                let sense = SenseData::invalid_command();
                Ok(ScsiResponse::check_condition(sense))
            }
        }?;

        if response.status == scsi_status::CHECK_CONDITION {
            if let Some(ref sense) = response.sense {
                ctx.last_sense = Some(sense.clone());
            }
        }

        Ok(response)
    }

    /// Handle TEST UNIT READY (0x00)
    fn handle_test_unit_ready() -> ScsiResult<ScsiResponse> {
        // Device is always ready
        Ok(ScsiResponse::good_no_data())
    }

    /// Handle INQUIRY (0x12)
    fn handle_inquiry(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 6 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let evpd = cdb[1] & 0x01;
        let page_code = cdb[2];
        let alloc_len = BigEndian::read_u16(&cdb[3..5]) as usize;

        if evpd != 0 {
            // VPD page request
            return Self::handle_inquiry_vpd(page_code, alloc_len, device);
        }

        // Standard INQUIRY response (36 bytes minimum)
        let mut data = vec![0u8; 96];

        // Peripheral device type: 0x00 = Direct access block device (disk)
        data[0] = 0x00;

        // RMB (Removable media bit) = 0 (not removable)
        data[1] = 0x00;

        // Version: 0x05 = SPC-3
        data[2] = 0x05;

        // Response data format: 0x02 = SPC-3
        // HiSup (hierarchical support) = 1
        data[3] = 0x12;

        // Additional length
        data[4] = 91; // Total length - 4

        // Flags
        data[5] = 0x00; // No special features
        data[6] = 0x00;
        data[7] = 0x02; // CmdQue = 1 (command queuing supported)

        // Vendor identification (8 bytes, space-padded)
        let vendor = device.vendor_id();
        let vendor_bytes = vendor.as_bytes();
        for (i, &b) in vendor_bytes.iter().take(8).enumerate() {
            data[8 + i] = b;
        }
        for i in vendor_bytes.len()..8 {
            data[8 + i] = b' ';
        }

        // Product identification (16 bytes, space-padded)
        let product = device.product_id();
        let product_bytes = product.as_bytes();
        for (i, &b) in product_bytes.iter().take(16).enumerate() {
            data[16 + i] = b;
        }
        for i in product_bytes.len()..16 {
            data[16 + i] = b' ';
        }

        // Product revision (4 bytes, space-padded)
        let rev = device.product_rev();
        let rev_bytes = rev.as_bytes();
        for (i, &b) in rev_bytes.iter().take(4).enumerate() {
            data[32 + i] = b;
        }
        for i in rev_bytes.len()..4 {
            data[32 + i] = b' ';
        }

        // Truncate to allocation length
        data.truncate(alloc_len.min(data.len()));

        Ok(ScsiResponse::good(data))
    }

    /// Handle INQUIRY VPD pages
    fn handle_inquiry_vpd(page_code: u8, alloc_len: usize, _device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        match page_code {
            0x00 => {
                // Supported VPD pages
                let mut data = vec![0x00, 0x00, 0x00, 7]; // Device type, page code, reserved, page length
                data.extend_from_slice(&[0x00, 0x80, 0x83, 0x86, 0xB0, 0xB1, 0xB2]); // Supported pages
                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0x80 => {
                // Unit Serial Number
                let mut data = vec![0x00, 0x80, 0x00, 16]; // Device type, page code, reserved, page length
                data.extend_from_slice(b"ISCSI00000000001"); // 16-char serial
                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0x83 => {
                // Device Identification
                let mut data = vec![0x00, 0x83, 0x00, 0x00]; // Header

                // NAA descriptor
                let naa_desc = [
                    0x01, 0x03, 0x00, 0x08, // Code set=binary, type=NAA, length=8
                    0x60, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, // NAA-6 identifier
                ];
                data.extend_from_slice(&naa_desc);

                // Update page length
                data[3] = (data.len() - 4) as u8;

                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0x86 => {
                // Extended INQUIRY Data: no special handling advertised
                // (GRD_CHK/APP_CHK/REF_CHK/UASK_SUP all 0, HEADSUP/ORDSUP/SIMPSUP
                // for command-ordering support are left unset since this
                // target executes tasks strictly in CmdSN order already).
                let mut data = vec![0u8; 64];
                data[1] = 0x86; // Page code
                BigEndian::write_u16(&mut data[2..4], 60); // Page length
                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0xB0 => {
                // Block Limits
                let mut data = vec![0u8; 64];
                data[0] = 0x00; // Device type
                data[1] = 0xB0; // Page code
                BigEndian::write_u16(&mut data[2..4], 60); // Page length

                // Maximum transfer length (in blocks)
                let max_xfer = 65535u32; // Max blocks per transfer
                BigEndian::write_u32(&mut data[8..12], max_xfer);

                // Optimal transfer length
                BigEndian::write_u32(&mut data[12..16], 128); // 128 blocks optimal

                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0xB1 => {
                // Block Device Characteristics: non-rotating (SSD-like),
                // no specific form factor claimed.
                let mut data = vec![0u8; 64];
                data[1] = 0xB1;
                BigEndian::write_u16(&mut data[2..4], 60);
                BigEndian::write_u16(&mut data[4..6], 1); // Medium rotation rate: non-rotating
                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            0xB2 => {
                // Logical Block Provisioning: thin provisioning disabled
                // (LBPU=0, LBPWS=0, LBPWS10=0, LBPRZ=0) — every bit in the
                // provisioning-support byte stays zero.
                let mut data = vec![0u8; 8];
                data[1] = 0xB2;
                BigEndian::write_u16(&mut data[2..4], 4);
                data.truncate(alloc_len.min(data.len()));
                Ok(ScsiResponse::good(data))
            }
            _ => {
                Ok(ScsiResponse::check_condition(SenseData::invalid_command()))
            }
        }
    }

    /// Handle READ CAPACITY (10) - 0x25
    fn handle_read_capacity_10(device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        let capacity = device.capacity();
        let block_size = device.block_size();

        // Response is 8 bytes: last LBA (4 bytes) + block size (4 bytes)
        let mut data = vec![0u8; 8];

        // Last logical block address (or 0xFFFFFFFF if > 2TB)
        let last_lba = if capacity > 0 { capacity - 1 } else { 0 };
        let last_lba_32 = if last_lba > 0xFFFF_FFFE {
            0xFFFF_FFFF_u32 // Signal to use READ CAPACITY 16
        } else {
            last_lba as u32
        };

        BigEndian::write_u32(&mut data[0..4], last_lba_32);
        BigEndian::write_u32(&mut data[4..8], block_size);

        Ok(ScsiResponse::good(data))
    }

    /// Handle SERVICE ACTION IN (16) - includes READ CAPACITY 16
    fn handle_service_action_in_16(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 16 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let service_action = cdb[1] & 0x1F;

        if service_action != 0x10 {
            // 0x10 = READ CAPACITY 16
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let alloc_len = BigEndian::read_u32(&cdb[10..14]) as usize;

        let capacity = device.capacity();
        let block_size = device.block_size();

        // Response is 32 bytes for READ CAPACITY 16
        let mut data = vec![0u8; 32];

        // Last logical block address (8 bytes)
        let last_lba = if capacity > 0 { capacity - 1 } else { 0 };
        BigEndian::write_u64(&mut data[0..8], last_lba);

        // Block size (4 bytes)
        BigEndian::write_u32(&mut data[8..12], block_size);

        // Logical/physical block exponent and LBP bits: thin provisioning
        // disabled, so byte 14's LBPME/LBPRZ bits stay 0.
        data[13] = 0x00;

        // Truncate to allocation length
        data.truncate(alloc_len.min(data.len()));

        Ok(ScsiResponse::good(data))
    }

    /// Handle READ (6) - 0x08
    fn handle_read_6(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 6 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = match Self::parse_rw6_cdb(cdb) {
            Some(v) => v,
            None => return Ok(ScsiResponse::check_condition(SenseData::invalid_command())),
        };
        Self::do_read(lba, transfer_length, device)
    }

    /// Handle READ (10) - 0x28
    fn handle_read_10(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 10 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw10_cdb(cdb).unwrap();
        Self::do_read(lba, transfer_length, device)
    }

    /// Handle READ (12) - 0xA8
    fn handle_read_12(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 12 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw12_cdb(cdb).unwrap();
        Self::do_read(lba, transfer_length, device)
    }

    /// Handle READ (16) - 0x88
    fn handle_read_16(cdb: &[u8], device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 16 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw16_cdb(cdb).unwrap();
        Self::do_read(lba, transfer_length, device)
    }

    fn do_read(lba: u64, transfer_length: u32, device: &dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        if transfer_length == 0 {
            return Ok(ScsiResponse::good_no_data());
        }

        let capacity = device.capacity();
        if lba + transfer_length as u64 > capacity {
            return Ok(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (lba & 0xFFFF_FFFF) as u32,
            )));
        }

        match device.read(lba, transfer_length, device.block_size()) {
            Ok(data) => Ok(ScsiResponse::good(data)),
            Err(_) => Ok(ScsiResponse::check_condition(SenseData::medium_error())),
        }
    }

    /// Handle WRITE (6) - 0x0A
    fn handle_write_6(
        cdb: &[u8],
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 6 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = match Self::parse_rw6_cdb(cdb) {
            Some(v) => v,
            None => return Ok(ScsiResponse::check_condition(SenseData::invalid_command())),
        };
        Self::do_write(lba, transfer_length, device, write_data)
    }

    /// Handle WRITE (10) - 0x2A
    fn handle_write_10(
        cdb: &[u8],
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 10 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw10_cdb(cdb).unwrap();
        Self::do_write(lba, transfer_length, device, write_data)
    }

    /// Handle WRITE (12) - 0xAA
    fn handle_write_12(
        cdb: &[u8],
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 12 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw12_cdb(cdb).unwrap();
        Self::do_write(lba, transfer_length, device, write_data)
    }

    /// Handle WRITE (16) - 0x8A
    fn handle_write_16(
        cdb: &[u8],
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 16 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let (lba, transfer_length) = Self::parse_rw16_cdb(cdb).unwrap();
        Self::do_write(lba, transfer_length, device, write_data)
    }

    fn do_write(
        lba: u64,
        transfer_length: u32,
        device: &mut dyn ScsiBlockDevice,
        write_data: Option<&[u8]>,
    ) -> ScsiResult<ScsiResponse> {
        if transfer_length == 0 {
            return Ok(ScsiResponse::good_no_data());
        }

        let capacity = device.capacity();
        if lba + transfer_length as u64 > capacity {
            return Ok(ScsiResponse::check_condition(SenseData::lba_out_of_range(
                (lba & 0xFFFF_FFFF) as u32,
            )));
        }

        let data = match write_data {
            Some(d) => d,
            None => {
                return Err(IscsiError::Scsi("Write data required but not provided".into()));
            }
        };

        let block_size = device.block_size();
        let expected_len = transfer_length as usize * block_size as usize;
        if data.len() < expected_len {
            return Err(IscsiError::Scsi(format!(
                "Write data too short: got {}, need {}",
                data.len(),
                expected_len
            )));
        }

        match device.write(lba, &data[..expected_len], block_size) {
            Ok(()) => Ok(ScsiResponse::good_no_data()),
            Err(_) => Ok(ScsiResponse::check_condition(SenseData::write_protected())),
        }
    }

    /// Handle MODE SENSE (6) - 0x1A
    fn handle_mode_sense_6(cdb: &[u8], block_size: u32) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 6 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let dbd = cdb[1] & 0x08 != 0;
        let pc = (cdb[2] & 0xC0) >> 6;
        let page_code = cdb[2] & 0x3F;
        let alloc_len = cdb[4] as usize;

        let block_descriptor = if dbd { Vec::new() } else { mode_sense_block_descriptor(block_size) };
        let pages = mode_sense_pages(page_code, pc)?;

        let mut data = vec![0u8; 4];
        data[1] = 0; // Medium type
        data[2] = 0; // Device-specific parameter (not write protected)
        data[3] = block_descriptor.len() as u8;
        data.extend_from_slice(&block_descriptor);
        data.extend_from_slice(&pages);
        data[0] = (data.len() - 1) as u8; // Mode data length (excludes this byte)

        data.truncate(alloc_len.min(data.len()));
        Ok(ScsiResponse::good(data))
    }

    /// Handle MODE SENSE (10) - 0x5A
    fn handle_mode_sense_10(cdb: &[u8], block_size: u32) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 10 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let dbd = cdb[1] & 0x08 != 0;
        let pc = (cdb[2] & 0xC0) >> 6;
        let page_code = cdb[2] & 0x3F;
        let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;

        let block_descriptor = if dbd { Vec::new() } else { mode_sense_block_descriptor(block_size) };
        let pages = mode_sense_pages(page_code, pc)?;

        let mut data = vec![0u8; 8];
        data[2] = 0; // Medium type
        data[3] = 0; // Device-specific parameter
        BigEndian::write_u16(&mut data[6..8], block_descriptor.len() as u16);
        data.extend_from_slice(&block_descriptor);
        data.extend_from_slice(&pages);
        let mode_data_len = (data.len() - 2) as u16;
        BigEndian::write_u16(&mut data[0..2], mode_data_len);

        data.truncate(alloc_len.min(data.len()));
        Ok(ScsiResponse::good(data))
    }

    /// Handle REQUEST SENSE - 0x03
    fn handle_request_sense(cdb: &[u8], ctx: &mut ScsiContext) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 6 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let alloc_len = cdb[4] as usize;

        // Return the last sense recorded for this I_T_L nexus, then clear it.
        let sense = ctx.last_sense.take().unwrap_or_else(SenseData::no_sense);
        let mut data = sense.to_bytes();
        data.truncate(alloc_len.min(data.len()));

        Ok(ScsiResponse::good(data))
    }

    /// Handle SYNCHRONIZE CACHE - 0x35 / 0x91
    fn handle_synchronize_cache(device: &mut dyn ScsiBlockDevice) -> ScsiResult<ScsiResponse> {
        match device.flush() {
            Ok(()) => Ok(ScsiResponse::good_no_data()),
            Err(_) => Ok(ScsiResponse::check_condition(SenseData::medium_error())),
        }
    }

    /// Handle REPORT LUNS - 0xA0
    fn handle_report_luns(cdb: &[u8]) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 12 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }

        let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;

        // Report LUN 0 only
        let mut data = vec![0u8; 16];
        BigEndian::write_u32(&mut data[0..4], 8); // LUN list length (1 LUN * 8 bytes)
        // data[4..8] reserved
        // data[8..16] = LUN 0 (all zeros)

        data.truncate(alloc_len.min(data.len()));
        Ok(ScsiResponse::good(data))
    }

    /// Handle REPORT LUNS for a known set of LUNs (SAM-3 8-byte LUN format).
    pub fn handle_report_luns_for(cdb: &[u8], luns: &[u64]) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 12 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let alloc_len = BigEndian::read_u32(&cdb[6..10]) as usize;

        let mut data = vec![0u8; 8 + luns.len() * 8];
        BigEndian::write_u32(&mut data[0..4], (luns.len() * 8) as u32);
        for (i, lun) in luns.iter().enumerate() {
            let offset = 8 + i * 8;
            // Peripheral device addressing method, LUN in the low byte.
            BigEndian::write_u64(&mut data[offset..offset + 8], *lun);
        }

        data.truncate(alloc_len.min(data.len()));
        Ok(ScsiResponse::good(data))
    }

    /// Handle START STOP UNIT - 0x1B
    fn handle_start_stop_unit(_cdb: &[u8]) -> ScsiResult<ScsiResponse> {
        // Accept but ignore start/stop commands
        Ok(ScsiResponse::good_no_data())
    }

    /// Handle RESERVE(6) - 0x16: legacy whole-LU reservation.
    fn handle_reserve_6(reservation: &Mutex<ReservationTable>, initiator_key: &str) -> ScsiResult<ScsiResponse> {
        let mut table = reservation
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("reservation mutex poisoned".into()))?;
        if let Some(ref holder) = table.legacy_holder {
            if holder != initiator_key {
                return Ok(ScsiResponse::reservation_conflict());
            }
        }
        table.legacy_holder = Some(initiator_key.to_string());
        Ok(ScsiResponse::good_no_data())
    }

    /// Handle RELEASE(6) - 0x17
    fn handle_release_6(reservation: &Mutex<ReservationTable>, initiator_key: &str) -> ScsiResult<ScsiResponse> {
        let mut table = reservation
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("reservation mutex poisoned".into()))?;
        if let Some(ref holder) = table.legacy_holder {
            if holder == initiator_key {
                table.legacy_holder = None;
            }
            // RELEASE by a non-holder is a no-op per SPC, not a conflict.
        }
        Ok(ScsiResponse::good_no_data())
    }

    /// Handle PERSISTENT RESERVE IN - 0x5E
    fn handle_pr_in(cdb: &[u8], reservation: &Mutex<ReservationTable>) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 10 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let service_action = cdb[1] & 0x1F;
        let alloc_len = BigEndian::read_u16(&cdb[7..9]) as usize;

        let table = reservation
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("reservation mutex poisoned".into()))?;

        let mut data = match service_action {
            0x00 => {
                // READ KEYS
                let mut d = vec![0u8; 8 + table.registrants.len() * 8];
                BigEndian::write_u32(&mut d[0..4], table.generation);
                BigEndian::write_u32(&mut d[4..8], (table.registrants.len() * 8) as u32);
                for (i, key) in table.registrants.keys().enumerate() {
                    BigEndian::write_u64(&mut d[8 + i * 8..16 + i * 8], *key);
                }
                d
            }
            0x01 => {
                // READ RESERVATION
                let mut d = vec![0u8; 8];
                BigEndian::write_u32(&mut d[0..4], table.generation);
                if let Some((key, pr_type)) = table.holder {
                    d.resize(24, 0);
                    BigEndian::write_u32(&mut d[4..8], 16);
                    BigEndian::write_u64(&mut d[8..16], key);
                    d[21] = pr_type & 0x0F;
                }
                d
            }
            _ => return Ok(ScsiResponse::check_condition(SenseData::invalid_command())),
        };

        data.truncate(alloc_len.min(data.len()));
        Ok(ScsiResponse::good(data))
    }

    /// Handle PERSISTENT RESERVE OUT - 0x5F
    fn handle_pr_out(
        cdb: &[u8],
        write_data: Option<&[u8]>,
        reservation: &Mutex<ReservationTable>,
        initiator_key: &str,
    ) -> ScsiResult<ScsiResponse> {
        if cdb.len() < 10 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let service_action = cdb[1] & 0x1F;
        let pr_type = cdb[2] & 0x0F;
        let param = write_data.unwrap_or(&[]);
        if param.len() < 24 {
            return Ok(ScsiResponse::check_condition(SenseData::invalid_command()));
        }
        let reservation_key = BigEndian::read_u64(&param[0..8]);
        let service_action_key = BigEndian::read_u64(&param[8..16]);

        let mut table = reservation
            .lock()
            .map_err(|_| IscsiError::InternalAssertionFailure("reservation mutex poisoned".into()))?;

        match service_action {
            0x00 | 0x06 => {
                // REGISTER / REGISTER_AND_IGNORE_EXISTING
                let ignore_existing = service_action == 0x06;
                if !ignore_existing {
                    if let Some(existing) = table.registrants.get(&reservation_key) {
                        if existing != initiator_key && reservation_key != 0 {
                            return Ok(ScsiResponse::reservation_conflict());
                        }
                    }
                }
                if service_action_key == 0 {
                    table.registrants.retain(|_, v| v != initiator_key);
                    if let Some((key, _)) = table.holder {
                        if table.registrants.get(&key).map(String::as_str) != Some(initiator_key) {
                            // holder's own registration removed: drop the reservation too
                        }
                    }
                    table.holder = table.holder.filter(|(key, _)| table.registrants.contains_key(key));
                } else {
                    table.registrants.insert(service_action_key, initiator_key.to_string());
                }
                table.generation += 1;
                Ok(ScsiResponse::good_no_data())
            }
            0x01 => {
                // RESERVE
                match table.registrants.get(&reservation_key) {
                    Some(holder) if holder == initiator_key => {
                        if let Some((existing_key, existing_type)) = table.holder {
                            if existing_key != reservation_key || existing_type != pr_type {
                                return Ok(ScsiResponse::reservation_conflict());
                            }
                        }
                        table.holder = Some((reservation_key, pr_type));
                        table.generation += 1;
                        Ok(ScsiResponse::good_no_data())
                    }
                    _ => Ok(ScsiResponse::reservation_conflict()),
                }
            }
            0x02 => {
                // RELEASE
                if let Some((key, _)) = table.holder {
                    if table.registrants.get(&key).map(String::as_str) == Some(initiator_key) {
                        table.holder = None;
                        table.generation += 1;
                    }
                }
                Ok(ScsiResponse::good_no_data())
            }
            0x03 => {
                // CLEAR
                table.registrants.clear();
                table.holder = None;
                table.legacy_holder = None;
                table.generation += 1;
                Ok(ScsiResponse::good_no_data())
            }
            0x04 | 0x05 => {
                // PREEMPT / PREEMPT_AND_ABORT: the preempting registrant takes
                // over the reservation, the preempted key's registration is
                // removed. Task cancellation for PREEMPT_AND_ABORT is not
                // wired to the LU task queue in this implementation.
                if !table.registrants.contains_key(&reservation_key) {
                    return Ok(ScsiResponse::reservation_conflict());
                }
                table.registrants.retain(|k, _| *k != service_action_key || *k == reservation_key);
                table.holder = Some((reservation_key, pr_type));
                table.generation += 1;
                Ok(ScsiResponse::good_no_data())
            }
            _ => Ok(ScsiResponse::check_condition(SenseData::invalid_command())),
        }
    }

    /// Parse LBA and transfer length from READ/WRITE 6 CDB
    pub fn parse_rw6_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
        if cdb.len() < 6 {
            return None;
        }
        let lba = (((cdb[1] & 0x1F) as u64) << 16) | ((cdb[2] as u64) << 8) | (cdb[3] as u64);
        let length = cdb[4] as u32;
        Some((lba, length))
    }

    /// Parse LBA and transfer length from READ/WRITE 10 CDB
    pub fn parse_rw10_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
        if cdb.len() < 10 {
            return None;
        }
        let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
        let length = BigEndian::read_u16(&cdb[7..9]) as u32;
        Some((lba, length))
    }

    /// Parse LBA and transfer length from READ/WRITE 12 CDB
    pub fn parse_rw12_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
        if cdb.len() < 12 {
            return None;
        }
        let lba = BigEndian::read_u32(&cdb[2..6]) as u64;
        let length = BigEndian::read_u32(&cdb[6..10]);
        Some((lba, length))
    }

    /// Parse LBA and transfer length from READ/WRITE 16 CDB
    pub fn parse_rw16_cdb(cdb: &[u8]) -> Option<(u64, u32)> {
        if cdb.len() < 16 {
            return None;
        }
        let lba = BigEndian::read_u64(&cdb[2..10]);
        let length = BigEndian::read_u32(&cdb[10..14]);
        Some((lba, length))
    }
}

fn mode_sense_block_descriptor(block_size: u32) -> Vec<u8> {
    let mut d = vec![0u8; 8];
    // Number of blocks left 0 (unspecified); block length in the low 3 bytes.
    d[5] = ((block_size >> 16) & 0xFF) as u8;
    d[6] = ((block_size >> 8) & 0xFF) as u8;
    d[7] = (block_size & 0xFF) as u8;
    d
}

/// Build the page-code-specific mode page bytes. `pc` is the Page Control
/// field (0=current, 1=changeable, 2=default, 3=saved); this target has no
/// persisted/changeable mode pages so all four report the same values.
fn mode_sense_pages(page_code: u8, _pc: u8) -> ScsiResult<Vec<u8>> {
    let mut out = Vec::new();
    match page_code {
        0x01 => out.extend_from_slice(&read_write_error_recovery_page()),
        0x08 => out.extend_from_slice(&caching_page()),
        0x0A => out.extend_from_slice(&control_page()),
        0x3F => {
            out.extend_from_slice(&read_write_error_recovery_page());
            out.extend_from_slice(&caching_page());
            out.extend_from_slice(&control_page());
        }
        _ => return Err(IscsiError::Scsi(format!("unsupported mode page 0x{page_code:02x}"))),
    }
    Ok(out)
}

/// Read-Write Error Recovery page (0x01), 12 bytes: no automatic retries
/// or read-continuous behavior beyond what the backing store itself does.
fn read_write_error_recovery_page() -> [u8; 12] {
    let mut page = [0u8; 12];
    page[0] = 0x01;
    page[1] = 10; // page length (excludes first 2 bytes)
    page
}

/// Caching page (0x08), 20 bytes: write-back caching disabled (WCE=0) so
/// SYNCHRONIZE CACHE's semantics are never relied upon for correctness.
fn caching_page() -> [u8; 20] {
    let mut page = [0u8; 20];
    page[0] = 0x08;
    page[1] = 18;
    page
}

/// Control page (0x0A), 10 bytes: defaults (GLTSD=0, D_SENSE=0 -> fixed
/// sense format, unrestricted queue algorithm).
fn control_page() -> [u8; 10] {
    let mut page = [0u8; 10];
    page[0] = 0x0A;
    page[1] = 0x0A;
    page
}

// ============================================================================
// Unit Tests
// ============================================================================
