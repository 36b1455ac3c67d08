//! Tests for REQUEST SENSE classification coverage
//!
//! These tests verify that:
//! 1. Every listed sense triple decodes to its status and description
//! 2. Fixed-format sense replies decode the same way as raw triples
//! 3. Failed commands surface the decoded status in their error text

use usb_msd::scsi::{sense_key, ScsiOpcode, SenseData};
use usb_msd::sense::{SenseStatus, SENSE_TABLE};
use usb_msd::MsdError;

// ============================================================================
// Unit Tests for the Sense Table
// ============================================================================

#[test]
fn test_decode_no_sense() {
    let status = SenseStatus::from_triple(0x00, 0x00, 0x00);
    assert_eq!(status, SenseStatus::NoSense);
    assert!(status.description().contains("no sense"));
}

#[test]
fn test_decode_not_ready_family() {
    assert_eq!(SenseStatus::from_triple(0x02, 0x04, 0x00), SenseStatus::NotReadyCauseNotReportable);
    assert_eq!(SenseStatus::from_triple(0x02, 0x04, 0x01), SenseStatus::BecomingReady);
    assert_eq!(SenseStatus::from_triple(0x02, 0x04, 0x02), SenseStatus::InitCommandRequired);
    assert_eq!(SenseStatus::from_triple(0x02, 0x04, 0x04), SenseStatus::FormatInProgress);
    assert_eq!(SenseStatus::from_triple(0x02, 0x3A, 0x00), SenseStatus::MediumNotPresent);
}

#[test]
fn test_decode_medium_errors() {
    let status = SenseStatus::from_triple(0x03, 0x11, 0x00);
    assert_eq!(status, SenseStatus::UnrecoveredReadError);
    assert!(status.description().contains("read error"), "Should mention the read error");
    assert_eq!(SenseStatus::from_triple(0x03, 0x03, 0x00), SenseStatus::WriteFault);
}

#[test]
fn test_decode_illegal_request_family() {
    assert_eq!(SenseStatus::from_triple(0x05, 0x20, 0x00), SenseStatus::InvalidCommandOpCode);
    assert_eq!(SenseStatus::from_triple(0x05, 0x21, 0x00), SenseStatus::LbaOutOfRange);
    assert_eq!(SenseStatus::from_triple(0x05, 0x24, 0x00), SenseStatus::InvalidFieldInCdb);
    assert_eq!(SenseStatus::from_triple(0x05, 0x25, 0x00), SenseStatus::LogicalUnitNotSupported);
}

#[test]
fn test_decode_unit_attention_is_transient() {
    for triple in [(0x06, 0x28, 0x00), (0x06, 0x29, 0x00), (0x06, 0x2A, 0x01)] {
        let status = SenseStatus::from_triple(triple.0, triple.1, triple.2);
        assert!(status.is_transient(), "{:?} should be transient", status);
    }
    assert!(!SenseStatus::MediumNotPresent.is_transient());
}

#[test]
fn test_decode_write_protect() {
    let status = SenseStatus::from_triple(0x07, 0x27, 0x00);
    assert_eq!(status, SenseStatus::WriteProtMedia);
    assert!(status.to_string().contains("write protected"));
}

#[test]
fn test_decode_unknown_triples() {
    // Right ASC under the wrong key, and an ASCQ nobody lists
    assert_eq!(SenseStatus::from_triple(0x05, 0x3A, 0x00), SenseStatus::Unknown);
    assert_eq!(SenseStatus::from_triple(0x02, 0x04, 0x09), SenseStatus::Unknown);
    assert!(SenseStatus::Unknown.description().contains("unknown"));
}

#[test]
fn test_table_descriptions_are_distinct() {
    let mut seen = std::collections::HashSet::new();
    for (status, _) in SENSE_TABLE.iter() {
        assert!(!status.description().is_empty());
        assert!(seen.insert(status.description()), "duplicate description for {:?}", status);
    }
    assert_eq!(SENSE_TABLE.len(), 30);
}

// ============================================================================
// Fixed-format Sense Replies
// ============================================================================

#[test]
fn test_fixed_format_reply_decodes() {
    let mut reply = [0u8; 18];
    reply[0] = 0x70;
    reply[2] = sense_key::NOT_READY;
    reply[7] = 10;
    reply[12] = 0x3A;
    reply[13] = 0x00;

    let sense = SenseData::from_bytes(&reply).expect("valid fixed-format sense");
    assert_eq!(sense.triple(), (0x02, 0x3A, 0x00));
    assert_eq!(SenseStatus::from(&sense), SenseStatus::MediumNotPresent);
}

#[test]
fn test_sense_key_flag_bits_ignored() {
    // ILI and EOM bits share the byte with the sense key
    let sense = SenseData::new(0x60 | sense_key::ILLEGAL_REQUEST, 0x21, 0x00);
    assert_eq!(SenseStatus::from(&sense), SenseStatus::LbaOutOfRange);
}

// ============================================================================
// Error Reporting
// ============================================================================

#[test]
fn test_command_failed_reports_sense() {
    let sense = SenseData::medium_not_present();
    let err = MsdError::CommandFailed {
        opcode: ScsiOpcode::Read10,
        reason: "CSW status 0x01".to_string(),
        status: SenseStatus::from(&sense),
        sense: Some(sense),
    };
    let msg = err.to_string();
    assert!(msg.contains("Read10"), "Should name the command");
    assert!(msg.contains("medium not present"), "Should include the decoded sense");
    assert_eq!(err.sense_status(), Some(SenseStatus::MediumNotPresent));
    assert!(!err.is_transport());
}
