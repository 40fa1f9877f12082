use crate::shared::AssociationId;

use rand::Rng;

/// Generates local verification tags, which identify associations at an endpoint
pub trait AssociationIdGenerator: Send {
    /// Generates a new AID
    ///
    /// The value lands in the Verification Tag of every packet the peer sends us, so it
    /// must be unpredictable and never zero.
    fn generate_aid(&mut self) -> AssociationId;
}

/// Generates purely random Association IDs
#[derive(Default, Debug, Clone, Copy)]
pub struct RandomAssociationIdGenerator;

impl RandomAssociationIdGenerator {
    /// Initialize Random AID generator
    pub fn new() -> Self {
        RandomAssociationIdGenerator
    }
}

impl AssociationIdGenerator for RandomAssociationIdGenerator {
    fn generate_aid(&mut self) -> AssociationId {
        generate_verification_tag(&mut rand::thread_rng())
    }
}

/// Serial Number Arithmetic (RFC 1982)
#[inline]
pub(crate) fn sna32lt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && i2 - i1 < 1 << 31) || (i1 > i2 && i1 - i2 > 1 << 31)
}

#[inline]
pub(crate) fn sna32lte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32lt(i1, i2)
}

#[inline]
pub(crate) fn sna32gt(i1: u32, i2: u32) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 31) || (i1 > i2 && (i1 - i2) <= 1 << 31)
}

#[inline]
pub(crate) fn sna32gte(i1: u32, i2: u32) -> bool {
    i1 == i2 || sna32gt(i1, i2)
}

#[inline]
pub(crate) fn sna16lt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) < 1 << 15) || (i1 > i2 && (i1 - i2) > 1 << 15)
}

#[inline]
pub(crate) fn sna16gt(i1: u16, i2: u16) -> bool {
    (i1 < i2 && (i2 - i1) >= 1 << 15) || (i1 > i2 && (i1 - i2) <= 1 << 15)
}

/// Larger of two TSNs in serial number order
#[inline]
pub(crate) fn max_tsn(a: u32, b: u32) -> u32 {
    if sna32gt(a, b) {
        a
    } else {
        b
    }
}

/// Verification tags are random and never zero (RFC 4960 sec 5.3.1).
pub(crate) fn generate_verification_tag<R: Rng + ?Sized>(rng: &mut R) -> u32 {
    loop {
        let tag = rng.gen::<u32>();
        if tag != 0 {
            return tag;
        }
    }
}
