use crossbeam::channel::{Receiver, Sender};

use super::{Command, Gateway};
use crate::types::SwitchId;
use crate::{Error, Result};

/// A gateway that queues every command on a channel.
///
/// The receiving side belongs to whatever speaks the real protocol, or to a
/// test inspecting what the controller emitted.
#[derive(Clone)]
pub struct ChanGateway {
    send: Sender<(SwitchId, Command)>,
}

impl ChanGateway {
    pub fn new(send: Sender<(SwitchId, Command)>) -> Self {
        ChanGateway { send }
    }

    /// A gateway together with the receiving end of its command queue.
    pub fn pair() -> (Self, Receiver<(SwitchId, Command)>) {
        let (tx, rx) = crossbeam::channel::unbounded();
        (ChanGateway::new(tx), rx)
    }
}

impl Gateway for ChanGateway {
    fn name() -> String {
        String::from("chan")
    }

    fn send(&self, switch: SwitchId, cmd: Command) -> Result<()> {
        self.send
            .send((switch, cmd))
            .map_err(|_| Error(String::from("gateway command channel closed")))
    }
}
