use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use visorbus::controlvm::{
    BusSpec, ChipsetFeatures, ChipsetHandler, CompletionStatus, ControlVmCommand, DeviceSpec,
    Outcome, Request, SegmentState,
};
use visorbus::diag::{event, module};
use visorbus::header::CHANNEL_HEADER_SIZE;
use visorbus::{DiagnosticSink, PostCode, Severity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipsetInfo {
    pub bus_count: u32,
    pub switch_count: u32,
    pub features: ChipsetFeatures,
    pub ready: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub spec: DeviceSpec,
    pub state: SegmentState,
    pub name: Option<String>,
    /// Created with `PRESERVE`: channel content belongs to a previous
    /// incarnation and was left as is.
    pub preserved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusRecord {
    pub spec: BusSpec,
    pub state: SegmentState,
    pub name: Option<String>,
    pub guest_handle: Option<u64>,
    pub devices: BTreeMap<u32, DeviceRecord>,
}

/// Bus and device bookkeeping of the chipset service.
///
/// Every request completes synchronously. State-change requests queue the
/// matching event for the service to post.
pub struct BusRegistry {
    chipset: Option<ChipsetInfo>,
    buses: BTreeMap<u32, BusRecord>,
    events: VecDeque<ControlVmCommand>,
    diag: Arc<dyn DiagnosticSink>,
}

fn fail(status: CompletionStatus) -> Outcome {
    Outcome::Complete(status)
}

impl BusRegistry {
    pub fn new(diag: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            chipset: None,
            buses: BTreeMap::new(),
            events: VecDeque::new(),
            diag,
        }
    }

    pub fn chipset(&self) -> Option<&ChipsetInfo> {
        self.chipset.as_ref()
    }

    pub fn bus(&self, bus_no: u32) -> Option<&BusRecord> {
        self.buses.get(&bus_no)
    }

    pub fn device(&self, bus_no: u32, dev_no: u32) -> Option<&DeviceRecord> {
        self.buses.get(&bus_no)?.devices.get(&dev_no)
    }

    pub fn bus_count(&self) -> usize {
        self.buses.len()
    }

    pub fn device_count(&self) -> usize {
        self.buses.values().map(|b| b.devices.len()).sum()
    }

    /// Events produced since the last call, oldest first.
    pub fn take_events(&mut self) -> Vec<ControlVmCommand> {
        self.events.drain(..).collect()
    }

    fn post(&self, event: u16, bus_no: u32, dev_no: u32) {
        self.diag.log_diagnostic(
            PostCode::new(module::CHIPSET, event)
                .with_detail(bus_no as u16, dev_no as u16)
                .encode(),
            Severity::Info,
        );
    }

    fn initialized(&self) -> Result<&ChipsetInfo, Outcome> {
        self.chipset
            .as_ref()
            .ok_or(fail(CompletionStatus::EXPECTED_CHIPSET_INIT))
    }

    fn device_mut(&mut self, bus_no: u32, dev_no: u32) -> Result<&mut DeviceRecord, Outcome> {
        self.initialized()?;
        self.buses
            .get_mut(&bus_no)
            .and_then(|bus| bus.devices.get_mut(&dev_no))
            .ok_or(fail(CompletionStatus::DEVICE_INVALID))
    }

    fn bus_mut(&mut self, bus_no: u32) -> Result<&mut BusRecord, Outcome> {
        self.initialized()?;
        self.buses
            .get_mut(&bus_no)
            .ok_or(fail(CompletionStatus::BUS_INVALID))
    }
}

fn name_of(req: &Request<'_>) -> Option<String> {
    req.payload.and_then(|p| p.name.clone())
}

macro_rules! check {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(outcome) => return outcome,
        }
    };
}

impl ChipsetHandler for BusRegistry {
    fn chipset_init(
        &mut self,
        _req: &Request<'_>,
        bus_count: u32,
        switch_count: u32,
        features: ChipsetFeatures,
    ) -> Outcome {
        if self.chipset.is_some() {
            return fail(CompletionStatus::ALREADY_DONE);
        }
        if switch_count != 0 {
            tracing::info!(switch_count, "Switches are not modelled, recording count only");
        }
        self.chipset = Some(ChipsetInfo {
            bus_count,
            switch_count,
            features,
            ready: false,
        });
        self.post(event::CHIPSET_INIT, bus_count, switch_count);
        tracing::info!(bus_count, ?features, "Chipset initialised");
        Outcome::ok()
    }

    fn chipset_ready(&mut self, _req: &Request<'_>) -> Outcome {
        let Some(chipset) = self.chipset.as_mut() else {
            return fail(CompletionStatus::EXPECTED_CHIPSET_INIT);
        };
        chipset.ready = true;
        tracing::info!("Chipset ready");
        Outcome::ok()
    }

    fn chipset_stop(&mut self, _req: &Request<'_>) -> Outcome {
        check!(self.initialized());
        if !self.buses.is_empty() {
            tracing::warn!(buses = self.buses.len(), "Chipset stop refused, buses still live");
            return fail(CompletionStatus::CHIPSET_STOP_FAILED_BUS);
        }
        self.chipset = None;
        tracing::info!("Chipset stopped");
        Outcome::ok()
    }

    fn chipset_selftest(&mut self, _req: &Request<'_>, options: u32, test: u32) -> Outcome {
        check!(self.initialized());
        tracing::debug!(options, test, "Selftest");
        Outcome::ok()
    }

    fn bus_create(&mut self, req: &Request<'_>, bus: &BusSpec) -> Outcome {
        let chipset = check!(self.initialized());
        if bus.bus_no >= chipset.bus_count {
            return fail(CompletionStatus::ERROR_MAX_BUSES);
        }
        if self.buses.contains_key(&bus.bus_no) {
            return fail(CompletionStatus::ALREADY_DONE);
        }
        self.buses.insert(
            bus.bus_no,
            BusRecord {
                spec: *bus,
                state: SegmentState::RUNNING,
                name: name_of(req),
                guest_handle: None,
                devices: BTreeMap::new(),
            },
        );
        self.post(event::BUS_CREATE, bus.bus_no, 0);
        tracing::info!(
            bus_no = bus.bus_no,
            dev_count = bus.dev_count,
            preserve = req.preserve(),
            "Bus created"
        );
        Outcome::ok()
    }

    fn bus_destroy(&mut self, _req: &Request<'_>, bus_no: u32) -> Outcome {
        let bus = check!(self.bus_mut(bus_no));
        if !bus.devices.is_empty() {
            return fail(CompletionStatus::ERROR_BUS_DEVICE_ATTACHED);
        }
        self.buses.remove(&bus_no);
        self.post(event::BUS_DESTROY, bus_no, 0);
        tracing::info!(bus_no, "Bus destroyed");
        Outcome::ok()
    }

    fn bus_configure(&mut self, req: &Request<'_>, bus_no: u32, guest_handle: u64) -> Outcome {
        let name = name_of(req);
        let bus = check!(self.bus_mut(bus_no));
        bus.guest_handle = Some(guest_handle);
        if name.is_some() {
            bus.name = name;
        }
        tracing::info!(bus_no, guest_handle, "Bus configured");
        Outcome::ok()
    }

    fn bus_change_state(&mut self, _req: &Request<'_>, bus_no: u32, state: SegmentState) -> Outcome {
        let bus = check!(self.bus_mut(bus_no));
        bus.state = state;
        self.events
            .push_back(ControlVmCommand::BusChangeStateEvent { bus_no, state });
        tracing::info!(bus_no, state = state.bits(), "Bus state changed");
        Outcome::ok()
    }

    fn device_create(&mut self, req: &Request<'_>, device: &DeviceSpec) -> Outcome {
        let name = name_of(req);
        let bus = check!(self.bus_mut(device.bus_no));
        if device.dev_no >= bus.spec.dev_count {
            return fail(CompletionStatus::ERROR_MAX_DEVICES);
        }
        if bus.devices.contains_key(&device.dev_no) {
            return fail(CompletionStatus::ALREADY_DONE);
        }
        if device.channel_addr == 0 {
            return fail(CompletionStatus::CHANNEL_INVALID);
        }
        if device.channel_bytes < CHANNEL_HEADER_SIZE as u64 {
            return fail(CompletionStatus::CHANNEL_SIZE_TOO_SMALL);
        }
        bus.devices.insert(
            device.dev_no,
            DeviceRecord {
                spec: *device,
                state: SegmentState::RUNNING,
                name,
                preserved: req.preserve(),
            },
        );
        self.post(event::DEVICE_CREATE, device.bus_no, device.dev_no);
        tracing::info!(
            bus_no = device.bus_no,
            dev_no = device.dev_no,
            data_type = %device.data_type,
            preserve = req.preserve(),
            "Device created"
        );
        Outcome::ok()
    }

    fn device_destroy(&mut self, _req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome {
        check!(self.device_mut(bus_no, dev_no));
        if let Some(bus) = self.buses.get_mut(&bus_no) {
            bus.devices.remove(&dev_no);
        }
        self.post(event::DEVICE_DESTROY, bus_no, dev_no);
        tracing::info!(bus_no, dev_no, "Device destroyed");
        Outcome::ok()
    }

    fn device_configure(&mut self, _req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome {
        check!(self.device_mut(bus_no, dev_no));
        tracing::info!(bus_no, dev_no, "Device configured");
        Outcome::ok()
    }

    fn device_reconfigure(&mut self, _req: &Request<'_>, bus_no: u32, dev_no: u32) -> Outcome {
        check!(self.device_mut(bus_no, dev_no));
        tracing::info!(bus_no, dev_no, "Device reconfigured");
        Outcome::ok()
    }

    fn device_change_state(
        &mut self,
        _req: &Request<'_>,
        bus_no: u32,
        dev_no: u32,
        state: SegmentState,
        phys_device: bool,
    ) -> Outcome {
        let device = check!(self.device_mut(bus_no, dev_no));
        device.state = state;
        self.events
            .push_back(ControlVmCommand::DeviceChangeStateEvent {
                bus_no,
                dev_no,
                state,
            });
        tracing::info!(bus_no, dev_no, state = state.bits(), phys_device, "Device state changed");
        Outcome::ok()
    }
}
