//! The response aggregator: per-command counters over container responses
//! and the terminal-state reducer that re-enters the sequencer.

use crate::logging::ResponseEvent;
use crate::messages::container::{ContainerRsp, ContainerRspPayload};
use crate::messages::CmdOpcode;
use crate::status::{aggregate, ApmError};
use crate::worker::Apm;

impl Apm {
    /// Folds one container response into its command, and resumes the
    /// command's sequence once every issued message has been answered.
    ///
    /// ETERMINATED is the container telling us it destroyed itself; it is
    /// not a failure and must leave the aggregate untouched so the destroy
    /// path proceeds normally.
    pub(crate) fn handle_container_rsp(&mut self, rsp: ContainerRsp) -> Result<(), ApmError> {
        let slot = rsp.token.slot;
        if self.cmds.get(slot).is_none() {
            // A response for a command that already ended; nothing owns it.
            return Err(ApmError::BadParam);
        }
        self.cmds.current = Some(slot);

        self.log(ResponseEvent {
            slot,
            container: rsp.token.container,
            opcode: rsp.opcode,
            result: rsp.result,
        });

        let ctrl = self.cmds.ctrl_mut(slot);
        let scratch = ctrl.scratch_mut(rsp.token.container);
        scratch.last_result = Some(rsp.result);
        if let Some(ContainerRspPayload::Cfg { params }) = rsp.payload {
            scratch.rsp_params = params;
        }

        ctrl.rsp.num_rsp_rcvd += 1;
        if rsp.result != Err(ApmError::Terminated) {
            ctrl.rsp.rsp_status = aggregate(ctrl.rsp.rsp_status, rsp.result);
            if rsp.result.is_err() {
                ctrl.rsp.num_rsp_failed += 1;
            }
        }

        if ctrl.rsp.num_rsp_rcvd < ctrl.rsp.num_cmd_issued {
            return Ok(());
        }

        // Fan-out complete: reduce into the command status, record the
        // sub-operation's status, and hand control back to the sequencer.
        ctrl.rsp.rsp_pending = false;
        if ctrl.opcode == CmdOpcode::GetCfg {
            // Container results stay separate from the sequencer status so
            // the client reply can carry them distinctly.
            ctrl.agg_rsp_status = ctrl.rsp.rsp_status;
        } else if ctrl.rsp.rsp_status.is_err() {
            ctrl.status = aggregate(ctrl.status, ctrl.rsp.rsp_status);
        }
        ctrl.seq.step_status = ctrl.status;
        ctrl.rsp.clear();

        self.resume_sequencer(slot)
    }
}
