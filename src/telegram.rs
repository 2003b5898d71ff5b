//! Telegram parsing and construction.
//!
//! A [`Telegram`] is a parsed eBUS message: a master part, and for MS
//! telegrams, a slave part. Validation happens per spec.md §6's order:
//! length, `QQ`, `ZZ`, `NN`, body length, CRC, then any required ACK. Each
//! half records its own [`PartState`] so a malformed telegram can still be
//! inspected (and published) rather than discarded outright.

use crate::{address, Sequence, BROADCAST};

/// Construction-time errors: these are the only cases where there isn't
/// enough of a telegram to even attempt validation.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum TelegramError {
    /// Fewer than 5 bytes: not enough to read `QQ ZZ PB SB NN`.
    #[error("telegram too short to contain a header")]
    TooShort,
    /// The caller-supplied `NN` field didn't match the actual data length,
    /// or the data length is outside `[0, 16]`.
    #[error("NN does not match the supplied data, or is out of [0,16]")]
    BadLength,
    /// The operation doesn't apply to this telegram's type (e.g. attaching
    /// a slave part to a BC/MM telegram, or setting a slave ACK on one).
    #[error("operation is not applicable to this telegram's type")]
    BadType,
}

/// Per-half validation outcome, independent for the master and slave parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Ok,
    TooShort,
    TooLong,
    BadNN,
    BadCRC,
    BadACK,
    BadQQ,
    BadZZ,
    MissingACK,
    Invalid,
}

impl PartState {
    fn is_ok(self) -> bool {
        matches!(self, PartState::Ok)
    }
}

impl std::fmt::Display for PartState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Telegram type, derived once from `ZZ` when the master part is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelegramType {
    /// `ZZ == BROADCAST`: no ACKs, no slave part.
    Bc,
    /// `ZZ` is a master address: one master-ACK, no slave part.
    Mm,
    /// `ZZ` is a slave address: full round trip with a slave part.
    Ms,
}

/// Where a telegram came from: observed on the wire, or built locally to
/// send. Lets `publish_cb` distinguish our own echoes from third-party
/// traffic without re-deriving it from `QQ`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// The master half of a telegram: `QQ ZZ PB SB NN D1..Dn CRCm [ACKm]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterPart {
    pub qq: u8,
    pub zz: u8,
    pub pb: u8,
    pub sb: u8,
    pub data: Vec<u8>,
    pub crc: Option<u8>,
    pub ack: Option<u8>,
    pub state: PartState,
}

/// The slave half of an MS telegram: `NN' D1'..Dm' CRCs ACKs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlavePart {
    pub data: Vec<u8>,
    pub crc: Option<u8>,
    pub ack: Option<u8>,
    pub state: PartState,
}

/// A parsed or locally-built eBUS telegram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    master: MasterPart,
    slave: Option<SlavePart>,
    ty: TelegramType,
    raw: Sequence,
    direction: Direction,
}

/// Derives the telegram type from the destination address, spec.md §3.
fn derive_type(zz: u8) -> TelegramType {
    if zz == BROADCAST {
        TelegramType::Bc
    } else if address::is_master(zz) {
        TelegramType::Mm
    } else {
        TelegramType::Ms
    }
}

impl Telegram {
    /// Builds a telegram from an application-provided unescaped master body
    /// (`ZZ PB SB NN D…`), prepending `QQ`. `NN` in the body must match the
    /// actual data count and lie in `[0, 16]`.
    pub fn from_master_bytes(qq: u8, body: &[u8]) -> Result<Telegram, TelegramError> {
        if body.len() < 4 {
            return Err(TelegramError::TooShort);
        }
        let zz = body[0];
        let pb = body[1];
        let sb = body[2];
        let nn_field = body[3] as usize;
        let data = body[4..].to_vec();
        if nn_field != data.len() || !(0..=16).contains(&data.len()) {
            return Err(TelegramError::BadLength);
        }

        let mut raw = Sequence::new();
        raw.push(qq);
        raw.push(zz);
        raw.push(pb);
        raw.push(sb);
        raw.push(data.len() as u8);
        raw.extend(data.iter().copied());
        let crc = raw.crc();
        raw.push(crc);

        let ty = derive_type(zz);
        Ok(Telegram {
            master: MasterPart {
                qq,
                zz,
                pb,
                sb,
                data,
                crc: Some(crc),
                ack: None,
                state: PartState::Ok,
            },
            slave: None,
            ty,
            raw,
            direction: Direction::Sent,
        })
    }

    /// Parses a captured, already-unescaped wire sequence: one full
    /// telegram including the CRCs and ACKs appropriate to its type, but
    /// not the trailing `SYN`.
    pub fn parse_wire(seq: &Sequence) -> Result<Telegram, TelegramError> {
        let bytes = seq.as_slice();
        if bytes.len() < 5 {
            return Err(TelegramError::TooShort);
        }
        let qq = bytes[0];
        let zz = bytes[1];
        let pb = bytes[2];
        let sb = bytes[3];
        let nn_field = bytes[4] as usize;
        let ty = derive_type(zz);

        let (master, next) = parse_master_part(bytes, qq, zz, pb, sb, nn_field, ty);

        let slave = match ty {
            TelegramType::Ms if master.state.is_ok() => Some(parse_slave_part(bytes, next)),
            _ => None,
        };

        Ok(Telegram {
            master,
            slave,
            ty,
            raw: seq.clone(),
            direction: Direction::Received,
        })
    }

    /// Records the observed master-ACK byte, cross-checking it against the
    /// expected `ACK`/`NAK` values.
    pub fn set_master_ack(&mut self, byte: u8) -> Result<(), TelegramError> {
        if matches!(self.ty, TelegramType::Bc) {
            return Err(TelegramError::BadType);
        }
        self.master.ack = Some(byte);
        self.raw.push(byte);
        if byte != crate::ACK && byte != crate::NAK {
            self.master.state = PartState::BadACK;
        }
        Ok(())
    }

    /// Records the observed slave-ACK byte (MS only).
    pub fn set_slave_ack(&mut self, byte: u8) -> Result<(), TelegramError> {
        let slave = self.slave.as_mut().ok_or(TelegramError::BadType)?;
        slave.ack = Some(byte);
        self.raw.push(byte);
        if byte != crate::ACK && byte != crate::NAK {
            slave.state = PartState::BadACK;
        }
        Ok(())
    }

    /// Installs a slave part built from an application-supplied raw body
    /// (`NN' D1'..Dm'`), for MS telegrams we are responding to.
    pub fn attach_slave(&mut self, body: &[u8]) -> Result<(), TelegramError> {
        if !matches!(self.ty, TelegramType::Ms) {
            return Err(TelegramError::BadType);
        }
        if body.is_empty() {
            return Err(TelegramError::TooShort);
        }
        let nn_field = body[0] as usize;
        let data = body[1..].to_vec();
        if nn_field != data.len() || !(0..=16).contains(&data.len()) {
            return Err(TelegramError::BadLength);
        }

        let mut slave_bytes = Sequence::new();
        slave_bytes.push(data.len() as u8);
        slave_bytes.extend(data.iter().copied());
        let crc = slave_bytes.crc();

        self.raw.push(data.len() as u8);
        self.raw.extend(data.iter().copied());
        self.raw.push(crc);

        self.slave = Some(SlavePart {
            data,
            crc: Some(crc),
            ack: None,
            state: PartState::Ok,
        });
        Ok(())
    }

    pub fn get_master(&self) -> &MasterPart {
        &self.master
    }

    pub fn get_slave(&self) -> Option<&SlavePart> {
        self.slave.as_ref()
    }

    pub fn telegram_type(&self) -> TelegramType {
        self.ty
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The unescaped wire bytes this telegram was parsed from, or built
    /// into so far.
    pub fn raw(&self) -> &Sequence {
        &self.raw
    }

    /// A master telegram is valid when its master part is `Ok` and, if an
    /// ACK is required for its type, that ACK is positive. An MS telegram
    /// additionally requires a valid, ACK'd slave part.
    pub fn is_valid(&self) -> bool {
        if !self.master.state.is_ok() {
            return false;
        }
        match self.ty {
            TelegramType::Bc => true,
            TelegramType::Mm => self.master.ack == Some(crate::ACK),
            TelegramType::Ms => {
                self.master.ack == Some(crate::ACK)
                    && self
                        .slave
                        .as_ref()
                        .is_some_and(|s| s.state.is_ok() && s.ack == Some(crate::ACK))
            }
        }
    }
}

/// Parses the master half, returning it alongside the index of the next
/// unread byte (the start of the slave part, for MS telegrams).
fn parse_master_part(
    bytes: &[u8],
    qq: u8,
    zz: u8,
    pb: u8,
    sb: u8,
    nn_field: usize,
    ty: TelegramType,
) -> (MasterPart, usize) {
    let empty = |state: PartState| MasterPart {
        qq,
        zz,
        pb,
        sb,
        data: Vec::new(),
        crc: None,
        ack: None,
        state,
    };

    if !address::is_master(qq) {
        return (empty(PartState::BadQQ), bytes.len());
    }
    if !address::is_valid_address(zz) {
        return (empty(PartState::BadZZ), bytes.len());
    }
    if !(0..=16).contains(&nn_field) {
        return (empty(PartState::BadNN), bytes.len());
    }

    let data_start = 5;
    let data_end = data_start + nn_field;
    let crc_index = data_end;
    let ack_len = if matches!(ty, TelegramType::Bc) { 0 } else { 1 };

    if bytes.len() < crc_index + 1 {
        return (empty(PartState::TooShort), bytes.len());
    }

    let data = bytes[data_start..data_end].to_vec();
    let computed_crc = Sequence::from_bytes(bytes[0..crc_index].to_vec()).crc();
    let transmitted_crc = bytes[crc_index];

    if computed_crc != transmitted_crc {
        return (
            MasterPart {
                qq,
                zz,
                pb,
                sb,
                data,
                crc: Some(transmitted_crc),
                ack: None,
                state: PartState::BadCRC,
            },
            crc_index + 1,
        );
    }

    if ack_len == 0 {
        return (
            MasterPart {
                qq,
                zz,
                pb,
                sb,
                data,
                crc: Some(transmitted_crc),
                ack: None,
                state: PartState::Ok,
            },
            crc_index + 1,
        );
    }

    let ack_index = crc_index + 1;
    if bytes.len() < ack_index + 1 {
        return (
            MasterPart {
                qq,
                zz,
                pb,
                sb,
                data,
                crc: Some(transmitted_crc),
                ack: None,
                state: PartState::MissingACK,
            },
            ack_index,
        );
    }

    let ack = bytes[ack_index];
    let state = if ack == crate::ACK {
        PartState::Ok
    } else {
        PartState::BadACK
    };

    (
        MasterPart {
            qq,
            zz,
            pb,
            sb,
            data,
            crc: Some(transmitted_crc),
            ack: Some(ack),
            state,
        },
        ack_index + 1,
    )
}

/// Parses the slave half starting at `start`, always present for MS
/// telegrams with a valid master part.
fn parse_slave_part(bytes: &[u8], start: usize) -> SlavePart {
    let empty = |state: PartState| SlavePart {
        data: Vec::new(),
        crc: None,
        ack: None,
        state,
    };

    if bytes.len() <= start {
        return empty(PartState::TooShort);
    }
    let nn_field = bytes[start] as usize;
    if !(0..=16).contains(&nn_field) {
        return empty(PartState::BadNN);
    }

    let data_start = start + 1;
    let data_end = data_start + nn_field;
    let crc_index = data_end;
    if bytes.len() < crc_index + 2 {
        return empty(PartState::TooShort);
    }

    let data = bytes[data_start..data_end].to_vec();
    let computed_crc = Sequence::from_bytes(bytes[start..crc_index].to_vec()).crc();
    let transmitted_crc = bytes[crc_index];
    if computed_crc != transmitted_crc {
        return SlavePart {
            data,
            crc: Some(transmitted_crc),
            ack: None,
            state: PartState::BadCRC,
        };
    }

    let ack = bytes[crc_index + 1];
    let state = if ack == crate::ACK {
        PartState::Ok
    } else {
        PartState::BadACK
    };

    SlavePart {
        data,
        crc: Some(transmitted_crc),
        ack: Some(ack),
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ACK;

    #[test]
    fn builds_broadcast_from_master_bytes() {
        let t = Telegram::from_master_bytes(0x03, &[0xFE, 0x07, 0x04, 0x00]).unwrap();
        assert_eq!(t.telegram_type(), TelegramType::Bc);
        assert!(t.is_valid());
        assert_eq!(t.get_master().data, Vec::<u8>::new());
    }

    #[test]
    fn rejects_mismatched_nn_field() {
        let err = Telegram::from_master_bytes(0x03, &[0x10, 0x07, 0x04, 0x02, 0xAB]).unwrap_err();
        assert_eq!(err, TelegramError::BadLength);
    }

    #[test]
    fn parse_wire_roundtrips_a_built_broadcast() {
        let built = Telegram::from_master_bytes(0x03, &[0xFE, 0x07, 0x04, 0x00, 0x01, 0x02, 0x03])
            .unwrap();
        let parsed = Telegram::parse_wire(built.raw()).unwrap();
        assert!(parsed.is_valid());
        assert_eq!(parsed.get_master().data, vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn parse_wire_roundtrips_mm_with_ack() {
        let mut built = Telegram::from_master_bytes(0x03, &[0x71, 0x05, 0x03, 0x01, 0x02, 0x03])
            .unwrap();
        built.set_master_ack(ACK).unwrap();
        let parsed = Telegram::parse_wire(built.raw()).unwrap();
        assert_eq!(parsed.telegram_type(), TelegramType::Mm);
        assert!(parsed.is_valid());
    }

    #[test]
    fn parse_wire_roundtrips_full_ms_exchange() {
        let mut built = Telegram::from_master_bytes(0x03, &[0x52, 0xB5, 0x09, 0x03, 0x0D, 0x07, 0x00])
            .unwrap();
        built.set_master_ack(ACK).unwrap();
        built.attach_slave(&[0x03, 0xAA, 0xBB, 0xCC]).unwrap();
        built.set_slave_ack(ACK).unwrap();

        let parsed = Telegram::parse_wire(built.raw()).unwrap();
        assert_eq!(parsed.telegram_type(), TelegramType::Ms);
        assert!(parsed.is_valid());
        assert_eq!(parsed.get_slave().unwrap().data, vec![0xAA, 0xBB, 0xCC]);
    }

    #[test]
    fn parse_wire_flags_bad_crc() {
        let built = Telegram::from_master_bytes(0x03, &[0xFE, 0x07, 0x04, 0x00]).unwrap();
        // corrupt the CRC byte
        let bad = {
            let mut bytes = built.raw().as_slice().to_vec();
            let last = bytes.len() - 1;
            bytes[last] ^= 0xFF;
            Sequence::from_bytes(bytes)
        };
        let parsed = Telegram::parse_wire(&bad).unwrap();
        assert_eq!(parsed.get_master().state, PartState::BadCRC);
        assert!(!parsed.is_valid());
    }

    #[test]
    fn parse_wire_rejects_non_master_qq() {
        let seq = Sequence::from_bytes(vec![0x02, 0xFE, 0x07, 0x04, 0x01, 0xAA, 0x00]);
        let parsed = Telegram::parse_wire(&seq).unwrap();
        assert_eq!(parsed.get_master().state, PartState::BadQQ);
    }

    #[test]
    fn attach_slave_rejected_for_broadcast() {
        let mut t = Telegram::from_master_bytes(0x03, &[0xFE, 0x07, 0x04, 0x00]).unwrap();
        assert_eq!(
            t.attach_slave(&[0x01, 0xAA]).unwrap_err(),
            TelegramError::BadType
        );
    }
}
