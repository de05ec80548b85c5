//! Packet ownership tokens moved through the interception data path.
//!
//! A [`Packet`] is deliberately not `Clone`: exactly one side of the
//! accept/complete boundary holds it at any time. The host adapter hands a
//! batch to an accept hook, receives the surviving batch back for
//! forwarding, and later returns the forwarded packets through the matching
//! complete hook. Dropped packets never come back.

use weir_common::{Direction, PacketMeta};

/// A single intercepted packet: metadata plus the raw frame.
#[derive(Debug)]
pub struct Packet {
    pub meta: PacketMeta,
    frame: Vec<u8>,
    /// Set by the accept hook when the packet was counted against its
    /// instance's pending counter. Bypassed packets stay untracked so the
    /// completion path can tell the two apart.
    tracked: bool,
}

impl Packet {
    pub fn new(meta: PacketMeta, frame: Vec<u8>) -> Self {
        Self {
            meta,
            frame,
            tracked: false,
        }
    }

    #[inline]
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.meta.direction
    }

    #[inline]
    pub(crate) fn mark_tracked(&mut self) {
        self.tracked = true;
    }

    #[inline]
    pub(crate) fn is_tracked(&self) -> bool {
        self.tracked
    }
}

/// An ordered group of packets delivered together by the host framework.
///
/// All packets in a batch share one direction. A batch may shrink while
/// passing through an accept hook (dropped packets are removed in place)
/// but survivor order is never changed.
#[derive(Debug)]
pub struct PacketBatch {
    direction: Direction,
    packets: Vec<Packet>,
}

impl PacketBatch {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            packets: Vec::new(),
        }
    }

    pub fn from_packets(direction: Direction, packets: Vec<Packet>) -> Self {
        Self { direction, packets }
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    pub(crate) fn packets_mut(&mut self) -> &mut Vec<Packet> {
        &mut self.packets
    }

    /// Consume the batch, yielding its packets in order.
    pub fn into_packets(self) -> Vec<Packet> {
        self.packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_preserves_push_order() {
        let mut batch = PacketBatch::new(Direction::Ingress);
        for port in [80u16, 443, 8080] {
            let mut meta = PacketMeta::default();
            meta.dst_port = port.to_be_bytes();
            batch.push(Packet::new(meta, vec![0; 64]));
        }
        let ports: Vec<u16> = batch.iter().map(|p| p.meta.dst_port()).collect();
        assert_eq!(ports, vec![80, 443, 8080]);
    }

    #[test]
    fn packets_start_untracked() {
        let packet = Packet::new(PacketMeta::default(), Vec::new());
        assert!(!packet.is_tracked());
    }
}
