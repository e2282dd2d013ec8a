//! Command payloads and the PID-tagged configuration envelope.
//!
//! Configuration payloads are a sequence of parameter records, each tagged
//! with a module instance and a parameter identifier. In-band commands
//! carry them already decoded; out-of-band commands reference a mapped
//! shared-memory region holding the same records in their wire layout:
//! little-endian `[module][pid][status][size]` headers followed by `size`
//! payload bytes, each record padded out to an 8-byte boundary. Structured
//! payloads (graph open, graph management) travel out-of-band as a single
//! serialized record instead.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::graph::{ContainerId, HeapId, LinkCfg, ModuleId, SubGraphId};
use crate::status::{status_from_wire, status_to_wire, ApmError, Status};

/// Record alignment within the shared-memory envelope.
const RECORD_ALIGN: usize = 8;

/// One parameter record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidPayload {
    pub module: ModuleId,
    pub pid: u32,
    /// Per-parameter status, written by the responding container.
    pub status: Status,
    pub data: Vec<u8>,
}

/// A reference to command payload bytes in a mapped region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OobRef {
    pub mem_map_handle: u32,
    pub offset: u32,
    pub payload_size: u32,
}

/// Payload of a command message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum CmdPayload {
    None,
    Open(OpenPayload),
    GraphMgmt(GraphMgmtPayload),
    /// In-band configuration records.
    Cfg(CfgPayload),
    /// Out-of-band payload; decoded per opcode after the region refcount
    /// is taken.
    OutOfBand(OobRef),
    /// Shared-memory map request carrying the region contents to mirror.
    MemMap { bytes: Vec<u8> },
    MemUnmap { mem_map_handle: u32 },
}

/// In-band configuration payload.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CfgPayload {
    pub params: Vec<PidPayload>,
}

/// The GRAPH_OPEN payload: sub-graphs, containers, modules, and links to
/// bring into existence.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OpenPayload {
    pub sub_graphs: Vec<SubGraphCfg>,
    pub containers: Vec<ContainerCfg>,
    pub modules: Vec<ModuleCfg>,
    pub links: Vec<LinkCfg>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SubGraphCfg {
    pub sub_graph_id: SubGraphId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ContainerCfg {
    pub container_id: ContainerId,
    pub heap_id: HeapId,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ModuleCfg {
    pub module_id: ModuleId,
    pub sub_graph_id: SubGraphId,
    pub container_id: ContainerId,
}

/// Payload of the graph-management commands: sub-graphs named directly,
/// plus link operations that implicate their host sub-graphs indirectly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GraphMgmtPayload {
    pub sub_graphs: Vec<SubGraphId>,
    pub links: Vec<LinkCfg>,
}

/// Encodes parameter records into their shared-memory wire layout.
pub fn encode_params(params: &[PidPayload]) -> Vec<u8> {
    let mut out = Vec::new();
    for param in params {
        out.write_u32::<LittleEndian>(param.module.0).expect("vec write");
        out.write_u32::<LittleEndian>(param.pid).expect("vec write");
        out.write_u32::<LittleEndian>(status_to_wire(param.status))
            .expect("vec write");
        out.write_u32::<LittleEndian>(param.data.len() as u32)
            .expect("vec write");
        out.extend_from_slice(&param.data);
        while out.len() % RECORD_ALIGN != 0 {
            out.push(0);
        }
    }
    out
}

/// Decodes a shared-memory parameter envelope.
pub fn decode_params(bytes: &[u8]) -> Result<Vec<PidPayload>, ApmError> {
    let mut cursor = Cursor::new(bytes);
    let mut params = Vec::new();

    while (cursor.position() as usize) < bytes.len() {
        let module = cursor.read_u32::<LittleEndian>().map_err(|_| ApmError::BadParam)?;
        let pid = cursor.read_u32::<LittleEndian>().map_err(|_| ApmError::BadParam)?;
        let status = cursor.read_u32::<LittleEndian>().map_err(|_| ApmError::BadParam)?;
        let size = cursor.read_u32::<LittleEndian>().map_err(|_| ApmError::BadParam)? as usize;

        let start = cursor.position() as usize;
        let end = start.checked_add(size).ok_or(ApmError::BadParam)?;
        if end > bytes.len() {
            return Err(ApmError::BadParam);
        }
        params.push(PidPayload {
            module: ModuleId(module),
            pid,
            status: status_from_wire(status),
            data: bytes[start..end].to_vec(),
        });

        let mut next = end;
        while next % RECORD_ALIGN != 0 {
            next += 1;
        }
        cursor.set_position(next.min(bytes.len()) as u64);
    }

    Ok(params)
}

/// Serializes a structured payload for out-of-band transport.
pub fn to_oob_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, ApmError> {
    bincode::serialize(value).map_err(|_| ApmError::NoMemory)
}

/// Recovers a structured payload from out-of-band bytes.
pub fn from_oob_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ApmError> {
    bincode::deserialize(bytes).map_err(|_| ApmError::BadParam)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn param(module: u32, pid: u32, data: &[u8]) -> PidPayload {
        PidPayload {
            module: ModuleId(module),
            pid,
            status: Ok(()),
            data: data.to_vec(),
        }
    }

    #[test]
    fn params_survive_the_envelope() {
        let params = vec![
            param(0xA1, 0x2000_1001, &[1, 2, 3]),
            param(0xA2, 0x2000_1002, &[]),
            PidPayload {
                module: ModuleId(0xA3),
                pid: 7,
                status: Err(ApmError::BadParam),
                data: vec![9; 13],
            },
        ];
        let bytes = encode_params(&params);
        assert_eq!(bytes.len() % RECORD_ALIGN, 0);
        assert_eq!(decode_params(&bytes).unwrap(), params);
    }

    #[test]
    fn truncated_envelopes_are_rejected() {
        let bytes = encode_params(&[param(0xA1, 1, &[1, 2, 3, 4, 5, 6, 7, 8])]);
        assert_eq!(decode_params(&bytes[..bytes.len() - 6]), Err(ApmError::BadParam));
        assert_eq!(decode_params(&bytes[..7]), Err(ApmError::BadParam));
    }

    #[test]
    fn structured_payloads_round_trip_out_of_band() {
        let payload = GraphMgmtPayload {
            sub_graphs: vec![SubGraphId(0x100), SubGraphId(0x200)],
            links: Vec::new(),
        };
        let bytes = to_oob_bytes(&payload).unwrap();
        let back: GraphMgmtPayload = from_oob_bytes(&bytes).unwrap();
        assert_eq!(back.sub_graphs, payload.sub_graphs);
    }
}
