//! Control-transfer handshake that turns a raw USB-serial bridge into a
//! configured 8-N-1 line.
//!
//! CH340 parts have no standard class interface, so the host has to poke
//! their registers with vendor requests before bulk data means anything.
//! Everything else is treated as USB-CDC and configured with the two
//! standard class requests.
use std::time::Duration;

use rusb::{Direction, GlobalContext, TransferType};
use serde::{Deserialize, Serialize};

use super::{ConnectionError, CH340_VID};

// bmRequestType values
pub const VENDOR_OUT: u8 = 0x40;
pub const CLASS_INTERFACE_OUT: u8 = 0x21;

// CH340 vendor requests
pub const CH340_REQ_INIT: u8 = 0xA1;
pub const CH340_REQ_WRITE_REG: u8 = 0x9A;
pub const CH340_REQ_RESET: u8 = 0x0F;
pub const CH340_REQ_MODEM_CTRL: u8 = 0xA4;

// CH340 register pairs (value field of WRITE_REG)
pub const CH340_REG_PRESCALER_DIVISOR: u16 = 0x1312;
pub const CH340_REG_FLOW: u16 = 0x0F2C;
pub const CH340_REG_LCR: u16 = 0x2518;
/// LCR1 = 0xC3 (rx/tx enable, 8 data bits), LCR2 = 0x00 (no parity, 1 stop).
pub const CH340_LCR_8N1: u16 = 0x00C3;
pub const CH340_MODEM_OUT: u16 = 0x00DA;

// CDC class requests
pub const CDC_SET_LINE_CODING: u8 = 0x20;
pub const CDC_SET_CONTROL_LINE_STATE: u8 = 0x22;
/// DTR | RTS
pub const CDC_LINE_STATE_DTR_RTS: u16 = 0x0003;

// bInterfaceClass values of a CDC-ACM function
pub const CDC_COMM_CLASS: u8 = 0x02;
pub const CDC_DATA_CLASS: u8 = 0x0A;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BridgeBaud {
    B9600,
    B115200,
}

impl BridgeBaud {
    pub fn bits_per_second(self) -> u32 {
        match self {
            BridgeBaud::B9600 => 9600,
            BridgeBaud::B115200 => 115_200,
        }
    }

    /// Prescaler/divisor word written to register 0x1312.
    fn ch340_divisor(self) -> u16 {
        match self {
            BridgeBaud::B9600 => 0xD982,
            BridgeBaud::B115200 => 0xCC00,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeChip {
    Ch340,
    Cdc,
}

impl BridgeChip {
    pub fn for_vendor(vendor_id: u16) -> Self {
        if vendor_id == CH340_VID {
            BridgeChip::Ch340
        } else {
            BridgeChip::Cdc
        }
    }
}

/// One host-to-device control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlTransfer {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub data: Vec<u8>,
    pub timeout: Duration,
}

impl ControlTransfer {
    fn new(request_type: u8, request: u8, value: u16, index: u16, timeout: Duration) -> Self {
        Self { request_type, request, value, index, data: Vec::new(), timeout }
    }

    fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

/// Anything that can issue an OUT control transfer.
pub trait ControlSink {
    fn control_out(&self, transfer: &ControlTransfer) -> Result<usize, rusb::Error>;
}

impl ControlSink for rusb::DeviceHandle<GlobalContext> {
    fn control_out(&self, transfer: &ControlTransfer) -> Result<usize, rusb::Error> {
        self.write_control(
            transfer.request_type,
            transfer.request,
            transfer.value,
            transfer.index,
            &transfer.data,
            transfer.timeout,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInitializer {
    pub chip: BridgeChip,
    pub baud: BridgeBaud,
    pub interface: u8,
    pub timeout: Duration,
}

impl BridgeInitializer {
    pub fn new(chip: BridgeChip, baud: BridgeBaud, interface: u8, timeout: Duration) -> Self {
        Self { chip, baud, interface, timeout }
    }

    pub fn for_vendor(vendor_id: u16, baud: BridgeBaud, interface: u8, timeout: Duration) -> Self {
        Self::new(BridgeChip::for_vendor(vendor_id), baud, interface, timeout)
    }

    /// The ordered transfer list for this chip and baud rate. Pure; the same
    /// configuration always yields the same list.
    pub fn plan(&self) -> Vec<ControlTransfer> {
        let t = self.timeout;
        match self.chip {
            BridgeChip::Ch340 => {
                let divisor = self.baud.ch340_divisor();
                let mut seq = vec![ControlTransfer::new(VENDOR_OUT, CH340_REQ_INIT, 0, 0, t)];
                match self.baud {
                    BridgeBaud::B115200 => {
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_PRESCALER_DIVISOR, divisor, t));
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_RESET, 0, 0, t));
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_PRESCALER_DIVISOR, divisor, t));
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_FLOW, 0x0003, t));
                    }
                    BridgeBaud::B9600 => {
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_PRESCALER_DIVISOR, divisor, t));
                        seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_FLOW, 0x0008, t));
                    }
                }
                seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_WRITE_REG, CH340_REG_LCR, CH340_LCR_8N1, t));
                seq.push(ControlTransfer::new(VENDOR_OUT, CH340_REQ_MODEM_CTRL, CH340_MODEM_OUT, 0, t));
                seq
            }
            BridgeChip::Cdc => {
                let index = u16::from(self.interface);
                let mut coding = self.baud.bits_per_second().to_le_bytes().to_vec();
                // stop bits 1, no parity, 8 data bits
                coding.extend_from_slice(&[0x00, 0x00, 0x08]);
                vec![
                    ControlTransfer::new(CLASS_INTERFACE_OUT, CDC_SET_LINE_CODING, 0, index, t).with_data(coding),
                    ControlTransfer::new(CLASS_INTERFACE_OUT, CDC_SET_CONTROL_LINE_STATE, CDC_LINE_STATE_DTR_RTS, index, t),
                ]
            }
        }
    }

    /// Sends every transfer in order. The first failure aborts the whole
    /// handshake; there is no partially initialized outcome.
    pub fn run(&self, sink: &dyn ControlSink) -> Result<(), ConnectionError> {
        log::debug!("Initializing {:?} bridge at {} baud", self.chip, self.baud.bits_per_second());
        for (step, transfer) in self.plan().iter().enumerate() {
            log::debug!(
                "bridge ctrl #{}: type=0x{:02X} req=0x{:02X} value=0x{:04X} index=0x{:04X} len={}",
                step, transfer.request_type, transfer.request, transfer.value, transfer.index, transfer.data.len()
            );
            sink.control_out(transfer).map_err(|e| {
                ConnectionError::BridgeInitFailed(format!(
                    "control transfer #{} (req 0x{:02X}, value 0x{:04X}) failed: {}",
                    step, transfer.request, transfer.value, e
                ))
            })?;
        }
        Ok(())
    }
}

/// Descriptor facts needed to pick the data endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSummary {
    pub address: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub bulk_in: u8,
    pub bulk_out: u8,
    pub in_packet_size: u16,
}

/// First bulk IN and first bulk OUT endpoint, or a fatal init error.
pub fn find_bulk_endpoints(endpoints: &[EndpointSummary]) -> Result<BulkEndpoints, ConnectionError> {
    let bulk = |dir: Direction| {
        endpoints
            .iter()
            .find(|ep| ep.transfer_type == TransferType::Bulk && ep.direction == dir)
    };
    match (bulk(Direction::In), bulk(Direction::Out)) {
        (Some(ep_in), Some(ep_out)) => Ok(BulkEndpoints {
            bulk_in: ep_in.address,
            bulk_out: ep_out.address,
            in_packet_size: ep_in.max_packet_size,
        }),
        (None, _) => Err(ConnectionError::BridgeInitFailed("no bulk IN endpoint".into())),
        (_, None) => Err(ConnectionError::BridgeInitFailed("no bulk OUT endpoint".into())),
    }
}

/// Descriptor facts for one interface of the active configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSummary {
    pub number: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointSummary>,
}

/// Which interfaces take the class requests and carry the bulk data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceLayout {
    pub control: u8,
    pub data: u8,
    pub endpoints: BulkEndpoints,
}

impl InterfaceLayout {
    /// Interfaces to claim, control first, without duplicates.
    pub fn claim_order(&self) -> Vec<u8> {
        if self.control == self.data {
            vec![self.control]
        } else {
            vec![self.control, self.data]
        }
    }
}

/// Picks the control and data interfaces for `chip`.
///
/// A CH340 exposes everything on the configured interface. A CDC-ACM
/// function splits the line-coding requests (communication class) from
/// the bulk pipes (data class); the configured number is only used when
/// the descriptor carries no such classes.
pub fn select_interfaces(
    chip: BridgeChip,
    configured: u8,
    interfaces: &[InterfaceSummary],
) -> Result<InterfaceLayout, ConnectionError> {
    let by_number = |number: u8| interfaces.iter().find(|i| i.number == number);
    let by_class = |class: u8| interfaces.iter().find(|i| i.class_code == class);

    let (control, data) = match chip {
        BridgeChip::Ch340 => {
            let iface = by_number(configured).ok_or_else(|| {
                ConnectionError::BridgeInitFailed(format!("interface {} not in active configuration", configured))
            })?;
            (iface.number, iface)
        }
        BridgeChip::Cdc => {
            let data = by_class(CDC_DATA_CLASS)
                .or_else(|| by_number(configured))
                .ok_or_else(|| ConnectionError::BridgeInitFailed("no CDC data interface".into()))?;
            let control = by_class(CDC_COMM_CLASS).map_or(data.number, |i| i.number);
            (control, data)
        }
    };
    let endpoints = find_bulk_endpoints(&data.endpoints)?;
    Ok(InterfaceLayout { control, data: data.number, endpoints })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingSink {
        sent: RefCell<Vec<ControlTransfer>>,
        fail_at: Option<usize>,
    }

    impl ControlSink for RecordingSink {
        fn control_out(&self, transfer: &ControlTransfer) -> Result<usize, rusb::Error> {
            let mut sent = self.sent.borrow_mut();
            if Some(sent.len()) == self.fail_at {
                return Err(rusb::Error::Pipe);
            }
            sent.push(transfer.clone());
            Ok(transfer.data.len())
        }
    }

    fn init(chip: BridgeChip, baud: BridgeBaud) -> BridgeInitializer {
        BridgeInitializer::new(chip, baud, 0, Duration::from_millis(1000))
    }

    fn triples(seq: &[ControlTransfer]) -> Vec<(u8, u16, u16)> {
        seq.iter().map(|t| (t.request, t.value, t.index)).collect()
    }

    #[test]
    fn ch340_115200_sequence() {
        let seq = init(BridgeChip::Ch340, BridgeBaud::B115200).plan();
        assert_eq!(
            triples(&seq),
            vec![
                (0xA1, 0x0000, 0x0000),
                (0x9A, 0x1312, 0xCC00),
                (0x0F, 0x0000, 0x0000),
                (0x9A, 0x1312, 0xCC00),
                (0x9A, 0x0F2C, 0x0003),
                (0x9A, 0x2518, 0x00C3),
                (0xA4, 0x00DA, 0x0000),
            ]
        );
        assert!(seq.iter().all(|t| t.request_type == VENDOR_OUT && t.data.is_empty()));
    }

    #[test]
    fn ch340_9600_sequence() {
        let seq = init(BridgeChip::Ch340, BridgeBaud::B9600).plan();
        assert_eq!(
            triples(&seq),
            vec![
                (0xA1, 0x0000, 0x0000),
                (0x9A, 0x1312, 0xD982),
                (0x9A, 0x0F2C, 0x0008),
                (0x9A, 0x2518, 0x00C3),
                (0xA4, 0x00DA, 0x0000),
            ]
        );
    }

    #[test]
    fn line_control_write_precedes_modem_control() {
        for baud in [BridgeBaud::B9600, BridgeBaud::B115200] {
            let seq = init(BridgeChip::Ch340, baud).plan();
            let lcr = seq.iter().position(|t| t.value == CH340_REG_LCR && t.index == CH340_LCR_8N1);
            let modem = seq.iter().position(|t| t.request == CH340_REQ_MODEM_CTRL);
            assert!(lcr.is_some(), "missing 8N1 line control write at {:?}", baud);
            assert!(lcr < modem);
        }
    }

    #[test]
    fn cdc_sequence_encodes_line_coding() {
        let seq = BridgeInitializer::new(BridgeChip::Cdc, BridgeBaud::B9600, 1, Duration::from_millis(1000)).plan();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq[0].request_type, CLASS_INTERFACE_OUT);
        assert_eq!(seq[0].request, CDC_SET_LINE_CODING);
        assert_eq!(seq[0].index, 1);
        assert_eq!(seq[0].data, vec![0x80, 0x25, 0x00, 0x00, 0x00, 0x00, 0x08]);
        assert_eq!(seq[1].request, CDC_SET_CONTROL_LINE_STATE);
        assert_eq!(seq[1].value, 0x0003);
    }

    #[test]
    fn vendor_id_selects_chip() {
        assert_eq!(BridgeChip::for_vendor(0x1A86), BridgeChip::Ch340);
        assert_eq!(BridgeChip::for_vendor(0x2341), BridgeChip::Cdc);
    }

    #[test]
    fn repeated_runs_send_identical_sequences() {
        let init = init(BridgeChip::Ch340, BridgeBaud::B115200);
        let first = RecordingSink::default();
        let second = RecordingSink::default();
        init.run(&first).unwrap();
        init.run(&second).unwrap();
        init.run(&second).unwrap();
        let first = first.sent.into_inner();
        let second = second.sent.into_inner();
        assert_eq!(first, init.plan());
        assert_eq!(second[..first.len()], first[..]);
        assert_eq!(second[first.len()..], first[..]);
    }

    #[test]
    fn failed_transfer_aborts_handshake() {
        let sink = RecordingSink { fail_at: Some(2), ..Default::default() };
        let err = init(BridgeChip::Ch340, BridgeBaud::B115200).run(&sink).unwrap_err();
        assert!(matches!(err, ConnectionError::BridgeInitFailed(_)));
        assert_eq!(sink.sent.borrow().len(), 2);
    }

    fn ep(address: u8, direction: Direction, transfer_type: TransferType) -> EndpointSummary {
        EndpointSummary { address, direction, transfer_type, max_packet_size: 32 }
    }

    #[test]
    fn bulk_endpoints_found_past_interrupt_endpoint() {
        let eps = [
            ep(0x81, Direction::In, TransferType::Interrupt),
            ep(0x82, Direction::In, TransferType::Bulk),
            ep(0x02, Direction::Out, TransferType::Bulk),
        ];
        let found = find_bulk_endpoints(&eps).unwrap();
        assert_eq!(found.bulk_in, 0x82);
        assert_eq!(found.bulk_out, 0x02);
    }

    fn acm_function() -> Vec<InterfaceSummary> {
        vec![
            InterfaceSummary {
                number: 0,
                class_code: CDC_COMM_CLASS,
                endpoints: vec![ep(0x82, Direction::In, TransferType::Interrupt)],
            },
            InterfaceSummary {
                number: 1,
                class_code: CDC_DATA_CLASS,
                endpoints: vec![
                    ep(0x04, Direction::Out, TransferType::Bulk),
                    ep(0x83, Direction::In, TransferType::Bulk),
                ],
            },
        ]
    }

    #[test]
    fn cdc_acm_splits_control_and_data_interfaces() {
        let layout = select_interfaces(BridgeChip::Cdc, 0, &acm_function()).unwrap();
        assert_eq!(layout.control, 0);
        assert_eq!(layout.data, 1);
        assert_eq!(layout.endpoints.bulk_in, 0x83);
        assert_eq!(layout.endpoints.bulk_out, 0x04);
        assert_eq!(layout.claim_order(), vec![0, 1]);

        let plan = BridgeInitializer::new(BridgeChip::Cdc, BridgeBaud::B9600, layout.control, Duration::from_millis(1000))
            .plan();
        assert!(plan.iter().all(|t| t.index == 0));
    }

    #[test]
    fn cdc_layout_ignores_configured_interface_when_classes_are_present() {
        let layout = select_interfaces(BridgeChip::Cdc, 1, &acm_function()).unwrap();
        assert_eq!((layout.control, layout.data), (0, 1));
    }

    #[test]
    fn ch340_uses_the_configured_interface_for_everything() {
        let vendor = [InterfaceSummary {
            number: 0,
            class_code: 0xFF,
            endpoints: vec![
                ep(0x81, Direction::In, TransferType::Interrupt),
                ep(0x82, Direction::In, TransferType::Bulk),
                ep(0x02, Direction::Out, TransferType::Bulk),
            ],
        }];
        let layout = select_interfaces(BridgeChip::Ch340, 0, &vendor).unwrap();
        assert_eq!((layout.control, layout.data), (0, 0));
        assert_eq!(layout.endpoints.bulk_in, 0x82);
        assert_eq!(layout.claim_order(), vec![0]);
        assert!(matches!(
            select_interfaces(BridgeChip::Ch340, 1, &vendor),
            Err(ConnectionError::BridgeInitFailed(_))
        ));
    }

    #[test]
    fn comm_interface_alone_has_no_data_pipes() {
        let comm_only = &acm_function()[..1];
        assert!(matches!(
            select_interfaces(BridgeChip::Cdc, 0, comm_only),
            Err(ConnectionError::BridgeInitFailed(_))
        ));
    }

    #[test]
    fn missing_bulk_endpoint_is_fatal() {
        let only_in = [ep(0x82, Direction::In, TransferType::Bulk)];
        assert!(matches!(find_bulk_endpoints(&only_in), Err(ConnectionError::BridgeInitFailed(_))));
        let only_out = [ep(0x02, Direction::Out, TransferType::Bulk)];
        assert!(matches!(find_bulk_endpoints(&only_out), Err(ConnectionError::BridgeInitFailed(_))));
        assert!(find_bulk_endpoints(&[]).is_err());
    }
}
