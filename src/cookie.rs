use crate::error::{Error, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ring::hmac;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

const COOKIE_FIXED_LENGTH: usize = 4 * 4 + 2 * 2 + 4 + 4 * 2 + 8 * 2 + 1 + 2;
const SIGNATURE_LENGTH: usize = 32;
const HEARTBEAT_INFO_LENGTH: usize = 4 + 4 + 8 + SIGNATURE_LENGTH;

const ADDRESS_FAMILY_IPV4: u8 = 4;
const ADDRESS_FAMILY_IPV6: u8 = 6;

/// The TCB summary a responder hands out in INIT ACK instead of keeping state
/// (RFC 4960 sec 5.1.3). Everything is seen from the responder's side: `local_tag` is
/// the Initiate Tag of the INIT ACK, `peer_tag` the one of the INIT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct StateCookie {
    pub(crate) local_tag: u32,
    pub(crate) peer_tag: u32,
    pub(crate) local_initial_tsn: u32,
    pub(crate) peer_initial_tsn: u32,
    pub(crate) num_outbound_streams: u16,
    pub(crate) num_inbound_streams: u16,
    pub(crate) peer_receiver_window: u32,
    pub(crate) local_tie_tag: u32,
    pub(crate) peer_tie_tag: u32,
    /// msec since the authenticator epoch
    pub(crate) created: u64,
    /// msec
    pub(crate) lifetime: u64,
    pub(crate) forward_tsn: bool,
    pub(crate) peer_addresses: Vec<IpAddr>,
}

impl StateCookie {
    fn marshal_to(&self, buf: &mut BytesMut) {
        buf.put_u32(self.local_tag);
        buf.put_u32(self.peer_tag);
        buf.put_u32(self.local_initial_tsn);
        buf.put_u32(self.peer_initial_tsn);
        buf.put_u16(self.num_outbound_streams);
        buf.put_u16(self.num_inbound_streams);
        buf.put_u32(self.peer_receiver_window);
        buf.put_u32(self.local_tie_tag);
        buf.put_u32(self.peer_tie_tag);
        buf.put_u64(self.created);
        buf.put_u64(self.lifetime);
        buf.put_u8(self.forward_tsn as u8);
        buf.put_u16(self.peer_addresses.len() as u16);
        for addr in &self.peer_addresses {
            match addr {
                IpAddr::V4(v4) => {
                    buf.put_u8(ADDRESS_FAMILY_IPV4);
                    buf.put_slice(&v4.octets());
                }
                IpAddr::V6(v6) => {
                    buf.put_u8(ADDRESS_FAMILY_IPV6);
                    buf.put_slice(&v6.octets());
                }
            }
        }
    }

    fn unmarshal(raw: &[u8]) -> Result<Self> {
        if raw.len() < COOKIE_FIXED_LENGTH {
            return Err(Error::ErrCookieTooShort);
        }
        let reader = &mut &raw[..];

        let mut cookie = StateCookie {
            local_tag: reader.get_u32(),
            peer_tag: reader.get_u32(),
            local_initial_tsn: reader.get_u32(),
            peer_initial_tsn: reader.get_u32(),
            num_outbound_streams: reader.get_u16(),
            num_inbound_streams: reader.get_u16(),
            peer_receiver_window: reader.get_u32(),
            local_tie_tag: reader.get_u32(),
            peer_tie_tag: reader.get_u32(),
            created: reader.get_u64(),
            lifetime: reader.get_u64(),
            forward_tsn: reader.get_u8() != 0,
            peer_addresses: vec![],
        };

        let n = reader.get_u16();
        for _ in 0..n {
            if reader.remaining() < 1 {
                return Err(Error::ErrCookieTooShort);
            }
            let family = reader.get_u8();
            let addr = match family {
                ADDRESS_FAMILY_IPV4 => {
                    if reader.remaining() < 4 {
                        return Err(Error::ErrCookieTooShort);
                    }
                    let mut octets = [0u8; 4];
                    reader.copy_to_slice(&mut octets);
                    IpAddr::V4(Ipv4Addr::from(octets))
                }
                ADDRESS_FAMILY_IPV6 => {
                    if reader.remaining() < 16 {
                        return Err(Error::ErrCookieTooShort);
                    }
                    let mut octets = [0u8; 16];
                    reader.copy_to_slice(&mut octets);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                typ => return Err(Error::ErrCookieUnknownField { typ: typ as u16 }),
            };
            cookie.peer_addresses.push(addr);
        }

        Ok(cookie)
    }

    /// How long ago the cookie expired, if it did
    pub(crate) fn staleness(&self, now_ms: u64) -> Option<Duration> {
        let expires = self.created.saturating_add(self.lifetime);
        if now_ms > expires {
            Some(Duration::from_millis(now_ms - expires))
        } else {
            None
        }
    }
}

/// Signs and verifies the opaque blobs an endpoint hands to its peers: state cookies and
/// heartbeat information. Timestamps inside them are msec relative to `epoch`.
#[derive(Debug, Clone)]
pub(crate) struct Authenticator {
    key: hmac::Key,
    epoch: Instant,
}

impl Authenticator {
    pub(crate) fn new(key: hmac::Key, epoch: Instant) -> Self {
        Authenticator { key, epoch }
    }

    pub(crate) fn now_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    pub(crate) fn instant(&self, ms: u64) -> Instant {
        self.epoch + Duration::from_millis(ms)
    }

    pub(crate) fn seal(&self, cookie: &StateCookie) -> Bytes {
        let mut buf = BytesMut::with_capacity(COOKIE_FIXED_LENGTH + SIGNATURE_LENGTH);
        cookie.marshal_to(&mut buf);
        let tag = hmac::sign(&self.key, &buf);
        buf.put_slice(tag.as_ref());
        buf.freeze()
    }

    /// Verifies the signature and decodes the cookie; staleness is left to the caller,
    /// which decides between an ERROR and a restart depending on the tags.
    pub(crate) fn open(&self, raw: &Bytes) -> Result<StateCookie> {
        if raw.len() < COOKIE_FIXED_LENGTH + SIGNATURE_LENGTH {
            return Err(Error::ErrCookieTooShort);
        }
        let (body, signature) = raw.split_at(raw.len() - SIGNATURE_LENGTH);
        hmac::verify(&self.key, body, signature).map_err(|_| Error::ErrCookieSignatureMismatch)?;
        StateCookie::unmarshal(body)
    }

    pub(crate) fn seal_heartbeat(&self, local_tag: u32, path: usize, now: Instant) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEARTBEAT_INFO_LENGTH);
        buf.put_u32(local_tag);
        buf.put_u32(path as u32);
        buf.put_u64(self.now_ms(now));
        let tag = hmac::sign(&self.key, &buf);
        buf.put_slice(tag.as_ref());
        buf.freeze()
    }

    /// Returns the path index and the send time of a heartbeat this association issued
    pub(crate) fn open_heartbeat(&self, local_tag: u32, info: &Bytes) -> Result<(usize, Instant)> {
        if info.len() != HEARTBEAT_INFO_LENGTH {
            return Err(Error::ErrHeartbeatInfoInvalid);
        }
        let (body, signature) = info.split_at(HEARTBEAT_INFO_LENGTH - SIGNATURE_LENGTH);
        hmac::verify(&self.key, body, signature).map_err(|_| Error::ErrHeartbeatInfoInvalid)?;

        let reader = &mut &body[..];
        if reader.get_u32() != local_tag {
            return Err(Error::ErrHeartbeatInfoInvalid);
        }
        let path = reader.get_u32() as usize;
        let sent = self.instant(reader.get_u64());
        Ok((path, sent))
    }
}
