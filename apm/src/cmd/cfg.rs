//! Configuration commands: parse the PID list, fan out to the implicated
//! containers, and assemble the reply.

use std::collections::BTreeMap;

use crate::graph::ContainerId;
use crate::messages::container::{ContainerOpcode, ContainerPayload};
use crate::messages::payload::{encode_params, PidPayload};
use crate::messages::CmdOpcode;
use crate::status::ApmError;
use crate::worker::Apm;

use super::sequencer::StepOutcome;

fn container_opcode(opcode: CmdOpcode) -> ContainerOpcode {
    match opcode {
        CmdOpcode::SetCfg => ContainerOpcode::SetCfg,
        CmdOpcode::GetCfg => ContainerOpcode::GetCfg,
        CmdOpcode::RegisterCfg => ContainerOpcode::RegisterCfg,
        _ => ContainerOpcode::DeregisterCfg,
    }
}

impl Apm {
    /// Every parameter record must address an open module instance.
    pub(crate) fn op_cfg_parse(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let params = self.cmds.ctrl(slot).cfg.params.clone();
        for param in &params {
            self.db.module(param.module)?;
        }
        Ok(StepOutcome::Done)
    }

    /// Hands each container its share of the parameter list.
    pub(crate) fn op_cfg_fanout(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        let opcode = container_opcode(self.cmds.ctrl(slot).opcode);
        let params = self.cmds.ctrl(slot).cfg.params.clone();

        let mut by_container: BTreeMap<ContainerId, Vec<PidPayload>> = BTreeMap::new();
        for param in params {
            let host = self.db.module(param.module)?.container;
            by_container.entry(host).or_default().push(param);
        }

        self.begin_fanout(slot);
        for (cid, params) in by_container {
            self.cmds.ctrl_mut(slot).scratch_mut(cid).params = params.clone();
            self.issue_to_container(slot, cid, opcode, ContainerPayload::Cfg { params })?;
        }
        Ok(self.fanout_outcome(slot))
    }

    /// GET_CFG: collect the containers' parameter data back into the
    /// request order, and write it out to shared memory for out-of-band
    /// queries.
    pub(crate) fn op_cfg_assemble_reply(&mut self, slot: usize) -> Result<StepOutcome, ApmError> {
        if self.cmds.ctrl(slot).opcode != CmdOpcode::GetCfg {
            return Ok(StepOutcome::Done);
        }

        let ctrl = self.cmds.ctrl(slot);
        let mut reply = Vec::with_capacity(ctrl.cfg.params.len());
        for requested in &ctrl.cfg.params {
            let returned = ctrl
                .cont_scratch
                .values()
                .flat_map(|s| s.rsp_params.iter())
                .find(|p| p.module == requested.module && p.pid == requested.pid);
            reply.push(returned.cloned().unwrap_or_else(|| requested.clone()));
        }

        let oob = ctrl.cfg.oob;
        if let Some(oob) = oob {
            let bytes = encode_params(&reply);
            self.shmem.write(oob.mem_map_handle, oob.offset, &bytes)?;
        }
        self.cmds.ctrl_mut(slot).cfg.reply_params = reply;
        Ok(StepOutcome::Done)
    }
}
