use std::time::Duration;

/// Transfer direction of a control request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Direction {
    /// Host to device
    Out = 0,

    /// Device to host
    In = 1,
}

impl Direction {
    /// Get the direction of an endpoint from its address.
    pub fn from_address(address: u8) -> Direction {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Specification defining the request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ControlType {
    /// Request defined by the USB standard.
    Standard = 0,

    /// Request defined by the standard USB class specification.
    Class = 1,

    /// Non-standard request.
    Vendor = 2,
}

/// Entity targeted by the request.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Recipient {
    /// Request made to device as a whole.
    Device = 0,

    /// Request made to specific interface.
    Interface = 1,

    /// Request made to specific endpoint.
    Endpoint = 2,

    /// Other request.
    Other = 3,
}

/// Setup fields of the next request issued on a control endpoint.
///
/// `wLength` is not part of it: it is taken from the length of the buffer
/// passed to the transfer.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ControlSetup {
    #[doc(alias = "bmRequestType")]
    pub direction: Direction,

    #[doc(alias = "bmRequestType")]
    pub control_type: ControlType,

    #[doc(alias = "bmRequestType")]
    pub recipient: Recipient,

    #[doc(alias = "bRequest")]
    pub request: u8,

    #[doc(alias = "wValue")]
    pub value: u16,

    #[doc(alias = "wIndex")]
    pub index: u16,
}

impl Default for ControlSetup {
    fn default() -> Self {
        ControlSetup {
            direction: Direction::Out,
            control_type: ControlType::Vendor,
            recipient: Recipient::Device,
            request: 0,
            value: 0,
            index: 0,
        }
    }
}

impl ControlSetup {
    pub(crate) fn request_type(&self) -> u8 {
        request_type(self.direction, self.control_type, self.recipient)
    }

    /// Pack the standard 8-byte setup packet.
    pub fn setup_packet(&self, length: u16) -> [u8; SETUP_PACKET_SIZE] {
        pack_setup(
            self.direction,
            self.control_type,
            self.recipient,
            self.request,
            self.value,
            self.index,
            length,
        )
    }
}

pub(crate) const SETUP_PACKET_SIZE: usize = 8;

fn pack_setup(
    direction: Direction,
    control_type: ControlType,
    recipient: Recipient,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
) -> [u8; SETUP_PACKET_SIZE] {
    let bmrequesttype = request_type(direction, control_type, recipient);

    [
        bmrequesttype,
        request,
        (value & 0xFF) as u8,
        (value >> 8) as u8,
        (index & 0xFF) as u8,
        (index >> 8) as u8,
        (length & 0xFF) as u8,
        (length >> 8) as u8,
    ]
}

fn request_type(direction: Direction, control_type: ControlType, recipient: Recipient) -> u8 {
    ((direction as u8) << 7) | ((control_type as u8) << 5) | (recipient as u8)
}

/// The driver takes control timeouts in whole seconds, with a floor of one.
pub(crate) fn control_timeout_secs(timeout: Duration) -> u32 {
    let secs = timeout.as_millis() / 1000;
    u32::try_from(secs).unwrap_or(u32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_type() {
        let setup = ControlSetup::default();
        assert_eq!(setup.request_type(), 0x40);

        let setup = ControlSetup {
            direction: Direction::In,
            control_type: ControlType::Standard,
            recipient: Recipient::Device,
            request: 0x06,
            value: 0x0302,
            index: 0x0409,
        };
        assert_eq!(setup.request_type(), 0x80);
        assert_eq!(
            setup.setup_packet(255),
            [0x80, 0x06, 0x02, 0x03, 0x09, 0x04, 0xFF, 0x00]
        );

        let setup = ControlSetup {
            direction: Direction::Out,
            control_type: ControlType::Class,
            recipient: Recipient::Interface,
            ..Default::default()
        };
        assert_eq!(setup.request_type(), 0x21);
    }

    #[test]
    fn test_control_timeout() {
        assert_eq!(control_timeout_secs(Duration::from_millis(10_000)), 10);
        assert_eq!(control_timeout_secs(Duration::from_millis(500)), 1);
        assert_eq!(control_timeout_secs(Duration::from_millis(0)), 1);
        assert_eq!(control_timeout_secs(Duration::from_millis(2_999)), 2);
    }

    #[test]
    fn test_direction_from_address() {
        assert_eq!(Direction::from_address(0x81), Direction::In);
        assert_eq!(Direction::from_address(0x02), Direction::Out);
    }
}
