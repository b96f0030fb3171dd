//! Wrapper type around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece. The first byte's most significant bit is
/// piece 0, as on the peer wire.
pub type Bitfield = BitVec<u8, Msb0>;
