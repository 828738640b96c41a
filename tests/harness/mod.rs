//! Drives a full controller runtime over the channel gateway.

use anyhow::{anyhow, bail, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use fairmeter::gateway::chan::ChanGateway;
use fairmeter::gateway::{Command, Event, MeterCommand, MeterMod, PacketIn};
use fairmeter::{ControllerHandle, Kbps, MacAddr, QosConfig, Registry, RunBuilder, SubscriberTable, SwitchId};
use std::time::{Duration, Instant};

pub const TIMEOUT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn mac(last: u8) -> MacAddr {
    MacAddr([0, 0, 0, 0, 0, last])
}

pub fn packet(switch: SwitchId, in_port: u32, src: u8, dst: u8) -> PacketIn {
    PacketIn {
        switch,
        in_port,
        src: mac(src),
        dst: mac(dst),
        eth_type: 0x0800,
        buffer_id: None,
        data: vec![0; 60],
        total_len: 60,
    }
}

pub fn meter_modify(meter_id: u32, rate: Kbps) -> Command {
    Command::MeterMod(MeterMod {
        command: MeterCommand::Modify,
        meter_id,
        rate,
        burst: 0,
    })
}

pub struct Harness {
    pub events: Sender<Event>,
    pub commands: Receiver<(SwitchId, Command)>,
    pub handle: ControllerHandle,
}

impl Harness {
    pub fn start(cfg: QosConfig, subscribers: &[(u8, Kbps)]) -> Result<Self> {
        init_tracing();
        let (gw, commands) = ChanGateway::pair();
        let (events, rx) = unbounded();
        let table: SubscriberTable = subscribers.iter().map(|&(m, r)| (mac(m), r)).collect();
        let handle = RunBuilder::new(gw, rx)
            .config(cfg)
            .subscribers(table)
            .spawn_thread()
            .run()
            .map_err(|e| anyhow!("start controller: {}", e.0))?;
        Ok(Harness {
            events,
            commands,
            handle,
        })
    }

    pub fn send(&self, ev: Event) -> Result<()> {
        self.events.send(ev)?;
        Ok(())
    }

    pub fn registry(&self) -> &Registry {
        self.handle.registry()
    }

    /// Collect the next `n` commands other than stats requests.
    pub fn commands(&self, n: usize) -> Result<Vec<(SwitchId, Command)>> {
        let deadline = Instant::now() + TIMEOUT;
        let mut got = vec![];
        while got.len() < n {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(left) {
                Ok((_, Command::MeterStatsRequest)) => continue,
                Ok(c) => got.push(c),
                Err(RecvTimeoutError::Timeout) => {
                    bail!("timed out after {} of {} commands: {:?}", got.len(), n, got)
                }
                Err(RecvTimeoutError::Disconnected) => bail!("gateway closed"),
            }
        }

        Ok(got)
    }

    /// Commands other than stats requests that are already queued.
    pub fn pending(&self) -> Vec<(SwitchId, Command)> {
        self.commands
            .try_iter()
            .filter(|(_, c)| *c != Command::MeterStatsRequest)
            .collect()
    }

    pub fn wait_until<F>(&self, what: &str, f: F) -> Result<()>
    where
        F: Fn(&Registry) -> bool,
    {
        let deadline = Instant::now() + TIMEOUT;
        while !f(self.registry()) {
            if Instant::now() > deadline {
                bail!("timed out waiting for {}", what);
            }

            std::thread::sleep(Duration::from_millis(5));
        }

        Ok(())
    }

    pub fn stop(self) -> Result<()> {
        self.handle.kill();
        self.handle.wait().map_err(|e| anyhow!("controller exited: {}", e.0))
    }
}
