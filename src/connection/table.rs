use std::net::Ipv4Addr;

use super::types::{ConnId, ConnKind, ConnStatus, Connection};
use crate::registry::Store;
use crate::registry::layout::*;

/// Fixed table of connection slots owned by one daemon.
#[derive(Debug)]
pub struct ConnectionTable {
    slots: Vec<Option<Connection>>,
}

impl ConnectionTable {
    pub fn new(my_ip: Ipv4Addr, now: u64) -> Self {
        let mut slots: Vec<Option<Connection>> = vec![None; MAX_CONNECTIONS];
        let mut udp = Connection::new(ConnId::UDP, ConnKind::Udp, my_ip, now);
        udp.status = ConnStatus::Ok;
        let mut listen = Connection::new(ConnId::SELF, ConnKind::Listen, my_ip, now);
        listen.status = ConnStatus::Ok;
        slots[0] = Some(udp);
        slots[1] = Some(listen);
        Self { slots }
    }

    /// Takes the lowest free peer slot.
    pub fn open(&mut self, kind: ConnKind, peer: Ipv4Addr, now: u64) -> Option<ConnId> {
        let index = (ConnId::FIRST_PEER as usize..MAX_CONNECTIONS)
            .find(|&i| self.slots[i].is_none())?;
        let id = ConnId(index as u16);
        self.slots[index] = Some(Connection::new(id, kind, peer, now));
        Some(id)
    }

    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.slots.get(id.0 as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut Connection> {
        self.slots.get_mut(id.0 as usize)?.as_mut()
    }

    pub fn status(&self, id: ConnId) -> ConnStatus {
        self.get(id).map_or(ConnStatus::Removed, |c| c.status)
    }

    pub fn set_status(&mut self, id: ConnId, status: ConnStatus) {
        if let Some(conn) = self.get_mut(id) {
            conn.status = status;
        }
    }

    pub fn remove(&mut self, id: ConnId) -> Option<Connection> {
        if !id.is_peer() {
            return None;
        }
        self.slots.get_mut(id.0 as usize)?.take()
    }

    pub fn peers(&self) -> impl Iterator<Item = &Connection> {
        self.slots
            .iter()
            .skip(ConnId::FIRST_PEER as usize)
            .filter_map(|c| c.as_ref())
    }

    pub fn daemons(&self) -> impl Iterator<Item = &Connection> {
        self.peers().filter(|c| c.is_daemon())
    }

    pub fn locals(&self) -> impl Iterator<Item = &Connection> {
        self.peers().filter(|c| c.is_local())
    }

    pub fn peer_ids(&self) -> Vec<ConnId> {
        self.peers().map(|c| c.id).collect()
    }

    pub fn find_daemon(&self, ip: Ipv4Addr) -> Option<ConnId> {
        self.daemons().find(|c| c.peer == ip).map(|c| c.id)
    }

    pub fn find_local_by_pid(&self, pid: i32) -> Option<ConnId> {
        self.locals().find(|c| c.pid == pid).map(|c| c.id)
    }

    pub fn find_local_by_node(&self, node: NodeId) -> Option<ConnId> {
        self.locals()
            .find(|c| c.node.node() == Some(node))
            .map(|c| c.id)
    }

    /// Writes a snapshot of every slot into the registry's local tail so
    /// observers on this host can inspect connections.
    pub fn publish(&self, store: &mut Store) {
        for (i, slot) in self.slots.iter().enumerate() {
            let at = CONNS_AT + i * CONN_RECORD_SIZE;
            match slot {
                None => store.zero(at, CONN_RECORD_SIZE),
                Some(c) => {
                    store.set_u32(at + CR_IP, u32::from(c.peer));
                    store.set_u8(at + CR_STATUS, c.status.code());
                    store.set_u8(at + CR_KIND, c.kind.code());
                    store.set_i16(
                        at + CR_NODE,
                        c.node.wire_id().map_or(NO_INDEX, |n| n as i16),
                    );
                    store.set_i32(at + CR_PID, c.pid);
                    store.set_i32(at + CR_PRIORITY, c.priority);
                    store.set_u64(at + CR_STARTED_AT, c.started_at);
                    store.set_u64(at + CR_RX_BYTES, c.rx_bytes);
                    store.set_u64(at + CR_TX_BYTES, c.tx_bytes);
                    store.set_u32(at + CR_RX_FRAMES, c.rx_frames);
                    store.set_u32(at + CR_TX_FRAMES, c.tx_frames);
                }
            }
        }
    }
}
