use std::fmt;

/// `completion_status` of a ControlVM response.
///
/// An open set: peers may send codes this side has no name for, and those
/// must survive a decode/encode cycle untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompletionStatus(pub u32);

impl CompletionStatus {
    pub const SUCCESS: Self = Self(0);
    pub const ALREADY_DONE: Self = Self(1);
    pub const IOREMAP_FAILED: Self = Self(2);
    pub const KMALLOC_FAILED: Self = Self(3);
    pub const ID_UNKNOWN: Self = Self(4);
    pub const ID_INVALID_FOR_CLIENT: Self = Self(5);

    pub const CLIENT_SWITCHCOUNT_NONZERO: Self = Self(100);
    pub const EXPECTED_CHIPSET_INIT: Self = Self(101);

    pub const ERROR_MAX_BUSES: Self = Self(201);
    pub const ERROR_MAX_DEVICES: Self = Self(202);

    pub const PAYLOAD_INVALID: Self = Self(400);
    pub const INITIATOR_PARAMETER_INVALID: Self = Self(401);
    pub const TARGET_PARAMETER_INVALID: Self = Self(402);
    pub const CLIENT_PARAMETER_INVALID: Self = Self(403);

    pub const BUS_INVALID: Self = Self(500);
    pub const DEVICE_INVALID: Self = Self(501);
    pub const CHANNEL_INVALID: Self = Self(502);

    pub const VIRTPCI_DRIVER_FAILURE: Self = Self(604);
    pub const VIRTPCI_DRIVER_CALLBACK_ERROR: Self = Self(605);
    pub const GENERIC_DRIVER_CALLBACK_ERROR: Self = Self(606);

    pub const ERROR_BUS_DEVICE_ATTACHED: Self = Self(700);

    pub const CHANNEL_TYPE_UNKNOWN: Self = Self(800);
    pub const CHANNEL_SIZE_TOO_SMALL: Self = Self(801);

    pub const CHIPSET_SHUTDOWN_FAILED: Self = Self(1000);
    pub const CHIPSET_SHUTDOWN_ALREADY_ACTIVE: Self = Self(1001);

    pub const CHIPSET_STOP_FAILED_BUS: Self = Self(1100);
    pub const CHIPSET_STOP_FAILED_SWITCH: Self = Self(1101);

    pub const DEVICE_UDEV_TIMEOUT: Self = Self(1400);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }

    pub fn name(self) -> Option<&'static str> {
        let name = match self.0 {
            0 => "SUCCESS",
            1 => "ALREADY_DONE",
            2 => "IOREMAP_FAILED",
            3 => "KMALLOC_FAILED",
            4 => "ID_UNKNOWN",
            5 => "ID_INVALID_FOR_CLIENT",
            100 => "CLIENT_SWITCHCOUNT_NONZERO",
            101 => "EXPECTED_CHIPSET_INIT",
            201 => "ERROR_MAX_BUSES",
            202 => "ERROR_MAX_DEVICES",
            400 => "PAYLOAD_INVALID",
            401 => "INITIATOR_PARAMETER_INVALID",
            402 => "TARGET_PARAMETER_INVALID",
            403 => "CLIENT_PARAMETER_INVALID",
            500 => "BUS_INVALID",
            501 => "DEVICE_INVALID",
            502 => "CHANNEL_INVALID",
            604 => "VIRTPCI_DRIVER_FAILURE",
            605 => "VIRTPCI_DRIVER_CALLBACK_ERROR",
            606 => "GENERIC_DRIVER_CALLBACK_ERROR",
            700 => "ERROR_BUS_DEVICE_ATTACHED",
            800 => "CHANNEL_TYPE_UNKNOWN",
            801 => "CHANNEL_SIZE_TOO_SMALL",
            1000 => "CHIPSET_SHUTDOWN_FAILED",
            1001 => "CHIPSET_SHUTDOWN_ALREADY_ACTIVE",
            1100 => "CHIPSET_STOP_FAILED_BUS",
            1101 => "CHIPSET_STOP_FAILED_SWITCH",
            1400 => "DEVICE_UDEV_TIMEOUT",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for CompletionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} ({})", self.0),
            None => write!(f, "UNKNOWN ({})", self.0),
        }
    }
}

impl From<u32> for CompletionStatus {
    fn from(value: u32) -> Self {
        Self(value)
    }
}
