//! Feedback carried by append responses.
//!
//! [`HotStandbyFeedback`] is part of the fixed append-response layout.
//! [`StorageFeedback`] is the extensible trailing section: a key count
//! followed by `name\0`, a big-endian `i32` length and the value for each key.
//! Newer acceptors may add keys or trailing bytes; both are skipped. A known
//! key that is cut short is an error.

use bytes::{Buf, BufMut, BytesMut};
use walprop_types::Lsn;

use crate::codec::BufExt;
use crate::error::{ProtocolError, WireResult};

const SECTION: &str = "storage feedback";

// Canonical key names written by `encode`.
const KEY_TIMELINE_SIZE: &str = "current_timeline_size";
const KEY_WRITE_LSN: &str = "ps_writelsn";
const KEY_FLUSH_LSN: &str = "ps_flushlsn";
const KEY_APPLY_LSN: &str = "ps_applylsn";
const KEY_REPLY_TIME: &str = "ps_replytime";

/// Hot standby feedback relayed from replicas.
///
/// `xmin` and `catalog_xmin` are full transaction ids; zero means "no
/// feedback".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HotStandbyFeedback {
    pub ts: i64,
    pub xmin: u64,
    pub catalog_xmin: u64,
}

impl HotStandbyFeedback {
    /// Encoded size in bytes.
    pub const WIRE_SIZE: usize =
        std::mem::size_of::<i64>() + std::mem::size_of::<u64>() + std::mem::size_of::<u64>();

    pub fn is_empty(&self) -> bool {
        self.xmin == 0 && self.catalog_xmin == 0
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.ts);
        buf.put_u64_le(self.xmin);
        buf.put_u64_le(self.catalog_xmin);
    }

    pub(crate) fn decode(buf: &mut &[u8], message: &'static str) -> WireResult<Self> {
        Ok(Self {
            ts: BufExt::try_get_i64_le(buf, message, "hs_feedback.ts")?,
            xmin: BufExt::try_get_u64_le(buf, message, "hs_feedback.xmin")?,
            catalog_xmin: BufExt::try_get_u64_le(buf, message, "hs_feedback.catalog_xmin")?,
        })
    }
}

/// Downstream storage progress, as relayed by an acceptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageFeedback {
    /// Current logical size of the timeline on the storage node.
    pub current_timeline_size: u64,
    /// Last WAL position received by storage.
    pub last_received_lsn: Lsn,
    /// Last WAL position durably written by storage.
    pub disk_consistent_lsn: Lsn,
    /// Last WAL position uploaded to remote storage.
    pub remote_consistent_lsn: Lsn,
    /// Time of the reply, microseconds since the storage node's epoch.
    pub replytime: i64,
}

enum Field {
    TimelineSize,
    WriteLsn,
    FlushLsn,
    ApplyLsn,
    ReplyTime,
}

impl Field {
    fn lookup(key: &str) -> Option<(Self, &'static str)> {
        match key {
            "current_timeline_size" => Some((Self::TimelineSize, KEY_TIMELINE_SIZE)),
            "ps_writelsn" | "last_received_lsn" => Some((Self::WriteLsn, KEY_WRITE_LSN)),
            "ps_flushlsn" | "disk_consistent_lsn" => Some((Self::FlushLsn, KEY_FLUSH_LSN)),
            "ps_applylsn" | "remote_consistent_lsn" => Some((Self::ApplyLsn, KEY_APPLY_LSN)),
            "ps_replytime" | "replytime" => Some((Self::ReplyTime, KEY_REPLY_TIME)),
            _ => None,
        }
    }
}

impl StorageFeedback {
    /// Appends the section to `buf`, all known keys included.
    pub fn encode(&self, buf: &mut BytesMut) {
        let entries: [(&str, u64); 5] = [
            (KEY_TIMELINE_SIZE, self.current_timeline_size),
            (KEY_WRITE_LSN, self.last_received_lsn.as_u64()),
            (KEY_FLUSH_LSN, self.disk_consistent_lsn.as_u64()),
            (KEY_APPLY_LSN, self.remote_consistent_lsn.as_u64()),
            (KEY_REPLY_TIME, self.replytime as u64),
        ];
        buf.put_u8(entries.len() as u8);
        for (key, value) in entries {
            buf.put_slice(key.as_bytes());
            buf.put_u8(0);
            buf.put_i32(8);
            buf.put_u64(value);
        }
    }

    /// Parses the section from the start of `buf`.
    ///
    /// Unknown keys are skipped by their declared length and any bytes after
    /// the last key are ignored.
    pub fn decode(mut buf: &[u8]) -> WireResult<Self> {
        let mut feedback = Self::default();
        let nkeys = BufExt::try_get_u8(&mut buf, SECTION, "key count")?;

        for _ in 0..nkeys {
            let key = read_cstr(&mut buf)?;
            let len = BufExt::try_get_i32(&mut buf, SECTION, "value length")?;

            let Some((field, name)) = Field::lookup(key) else {
                let skip = usize::try_from(len).map_err(|_| ProtocolError::Truncated {
                    message: SECTION,
                    field: "unknown key value",
                })?;
                if buf.remaining() < skip {
                    return Err(ProtocolError::Truncated {
                        message: SECTION,
                        field: "unknown key value",
                    });
                }
                buf.advance(skip);
                continue;
            };

            if len != 8 {
                return Err(ProtocolError::InvalidFeedbackLength { key: name, len });
            }
            let value = BufExt::try_get_u64(&mut buf, SECTION, name)?;
            match field {
                Field::TimelineSize => feedback.current_timeline_size = value,
                Field::WriteLsn => feedback.last_received_lsn = Lsn::new(value),
                Field::FlushLsn => feedback.disk_consistent_lsn = Lsn::new(value),
                Field::ApplyLsn => feedback.remote_consistent_lsn = Lsn::new(value),
                Field::ReplyTime => feedback.replytime = value as i64,
            }
        }

        Ok(feedback)
    }
}

fn read_cstr<'a>(buf: &mut &'a [u8]) -> WireResult<&'a str> {
    let data: &'a [u8] = *buf;
    let nul = data
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::MalformedFeedbackKey)?;
    let key = std::str::from_utf8(&data[..nul]).map_err(|_| ProtocolError::MalformedFeedbackKey)?;
    *buf = &data[nul + 1..];
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StorageFeedback {
        StorageFeedback {
            current_timeline_size: 42 << 20,
            last_received_lsn: Lsn::new(0x3000),
            disk_consistent_lsn: Lsn::new(0x2000),
            remote_consistent_lsn: Lsn::new(0x1000),
            replytime: 1_700_000_000,
        }
    }

    fn put_key(buf: &mut BytesMut, key: &str, value: &[u8]) {
        buf.put_slice(key.as_bytes());
        buf.put_u8(0);
        buf.put_i32(value.len() as i32);
        buf.put_slice(value);
    }

    #[test]
    fn storage_feedback_round_trip() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        assert_eq!(StorageFeedback::decode(&buf), Ok(sample()));
    }

    #[test]
    fn legacy_key_names_are_accepted() {
        let mut buf = BytesMut::new();
        buf.put_u8(2);
        put_key(&mut buf, "last_received_lsn", &77u64.to_be_bytes());
        put_key(&mut buf, "replytime", &5u64.to_be_bytes());

        let fb = StorageFeedback::decode(&buf).expect("decodes");
        assert_eq!(fb.last_received_lsn, Lsn::new(77));
        assert_eq!(fb.replytime, 5);
    }

    #[test]
    fn unknown_keys_and_trailing_bytes_are_skipped() {
        let mut buf = BytesMut::new();
        buf.put_u8(3);
        put_key(&mut buf, "shard_number", &[1, 2, 3]);
        put_key(&mut buf, "ps_flushlsn", &0x2000u64.to_be_bytes());
        put_key(&mut buf, "future_thing", &[]);
        buf.put_slice(b"bytes from a newer acceptor");

        let fb = StorageFeedback::decode(&buf).expect("decodes");
        assert_eq!(fb.disk_consistent_lsn, Lsn::new(0x2000));
        assert_eq!(fb.current_timeline_size, 0);
    }

    #[test]
    fn truncated_known_key_is_an_error() {
        let mut buf = BytesMut::new();
        sample().encode(&mut buf);
        let cut = &buf[..buf.len() - 3];
        assert!(matches!(
            StorageFeedback::decode(cut),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn known_key_with_wrong_length_is_an_error() {
        let mut buf = BytesMut::new();
        buf.put_u8(1);
        put_key(&mut buf, "ps_applylsn", &[0, 1, 2, 3]);
        assert_eq!(
            StorageFeedback::decode(&buf),
            Err(ProtocolError::InvalidFeedbackLength {
                key: "ps_applylsn",
                len: 4
            })
        );
    }

    #[test]
    fn unterminated_key_is_malformed() {
        let buf = [1u8, b'p', b's'];
        assert_eq!(
            StorageFeedback::decode(&buf),
            Err(ProtocolError::MalformedFeedbackKey)
        );
    }
}
