//! Checked field readers.
//!
//! `bytes::Buf` getters panic on short input; every read from the network goes
//! through these instead and turns a short buffer into
//! [`ProtocolError::Truncated`].

use bytes::Buf;

use crate::error::{ProtocolError, WireResult};

macro_rules! checked_get {
    ($name:ident, $get:ident, $ty:ty) => {
        fn $name(&mut self, message: &'static str, field: &'static str) -> WireResult<$ty> {
            if self.remaining() < std::mem::size_of::<$ty>() {
                return Err(ProtocolError::Truncated { message, field });
            }
            Ok(self.$get())
        }
    };
}

pub(crate) trait BufExt: Buf {
    checked_get!(try_get_u8, get_u8, u8);
    checked_get!(try_get_u32_le, get_u32_le, u32);
    checked_get!(try_get_u64_le, get_u64_le, u64);
    checked_get!(try_get_i64_le, get_i64_le, i64);
    checked_get!(try_get_i32, get_i32, i32);
    checked_get!(try_get_u64, get_u64, u64);

    fn try_get_array16(
        &mut self,
        message: &'static str,
        field: &'static str,
    ) -> WireResult<[u8; 16]> {
        if self.remaining() < 16 {
            return Err(ProtocolError::Truncated { message, field });
        }
        let mut out = [0u8; 16];
        self.copy_to_slice(&mut out);
        Ok(out)
    }
}

impl<B: Buf + ?Sized> BufExt for B {}
