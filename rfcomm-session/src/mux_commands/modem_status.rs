//! Modem Status Command (MSC), GSM 07.10 5.4.6.3.7
//!
//! Conveys the V.24 control signals of a DLC, with an optional break octet.

use rfcomm_core::{Dlci, RfcommError, RfcommResult};

const MODEM_STATUS_WITHOUT_BREAK_LENGTH: usize = 2;
const MODEM_STATUS_WITH_BREAK_LENGTH: usize = 3;

/// The V.24 signal octet of an MSC exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModemStatusSignals(u8);

impl ModemStatusSignals {
    /// Signals asserted on a freshly established DLC: Ready To Communicate,
    /// Ready To Receive, Data Valid.
    pub fn default_signals() -> Self {
        let mut signals = ModemStatusSignals(0);
        signals.0 |= 0x04 | 0x08 | 0x80;
        signals
    }

    pub fn flow_control(&self) -> bool {
        self.0 & 0x02 != 0
    }

    pub fn ready_to_communicate(&self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn ready_to_receive(&self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn incoming_call(&self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn data_valid(&self) -> bool {
        self.0 & 0x80 != 0
    }

    fn from_octet(octet: u8) -> Self {
        // The E/A bit is envelope framing, not a signal.
        ModemStatusSignals(octet & !0x01)
    }
}

/// Parameters of an MSC command or response.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModemStatusParams {
    pub dlci: Dlci,
    pub signals: ModemStatusSignals,
    /// Break duration in units of 200 ms, if a break is signaled.
    pub break_value: Option<u8>,
}

impl ModemStatusParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        if buf.len() != MODEM_STATUS_WITHOUT_BREAK_LENGTH
            && buf.len() != MODEM_STATUS_WITH_BREAK_LENGTH
        {
            return Err(RfcommError::FrameInvalid(format!(
                "MSC payload must be 2 or 3 bytes, got {}",
                buf.len()
            )));
        }

        // Address octet: EA = 1, bit 1 always set, DLCI in bits 2..=7.
        let dlci = Dlci::try_from(buf[0] >> 2)?;
        let signals = ModemStatusSignals::from_octet(buf[1]);

        let mut break_value = None;
        if buf.len() == MODEM_STATUS_WITH_BREAK_LENGTH {
            let octet = buf[2];
            if octet & 0x02 != 0 {
                break_value = Some(octet >> 4);
            }
        }

        Ok(Self { dlci, signals, break_value })
    }

    pub fn encode(&self) -> Vec<u8> {
        let address = (u8::from(self.dlci) << 2) | 0x02 | 0x01;
        match self.break_value {
            None => vec![address, self.signals.0 | 0x01],
            Some(value) => {
                vec![address, self.signals.0, ((value & 0x0F) << 4) | 0x02 | 0x01]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_invalid_length() {
        assert!(ModemStatusParams::decode(&[]).is_err());
        assert!(ModemStatusParams::decode(&[0x0F]).is_err());
        assert!(ModemStatusParams::decode(&[0x0F, 0x01, 0x01, 0x01]).is_err());
    }

    #[test]
    fn test_decode_invalid_dlci() {
        // DLCI 1 is reserved.
        let buf = [0b0000_0111, 0x01];
        assert!(ModemStatusParams::decode(&buf).is_err());
    }

    #[test]
    fn test_decode_without_break() {
        let buf = [0b0000_1111, 0b1000_1101];
        let params = ModemStatusParams::decode(&buf).unwrap();
        assert_eq!(u8::from(params.dlci), 3);
        assert!(params.signals.ready_to_communicate());
        assert!(params.signals.ready_to_receive());
        assert!(params.signals.data_valid());
        assert!(!params.signals.flow_control());
        assert_eq!(params.break_value, None);
    }

    #[test]
    fn test_decode_with_break() {
        let buf = [0b0001_1111, 0b1000_1100, 0b1010_0011];
        let params = ModemStatusParams::decode(&buf).unwrap();
        assert_eq!(u8::from(params.dlci), 7);
        assert_eq!(params.break_value, Some(10));
    }

    #[test]
    fn test_round_trip() {
        for break_value in [None, Some(3)] {
            let params = ModemStatusParams {
                dlci: Dlci::try_from(6).unwrap(),
                signals: ModemStatusSignals::default_signals(),
                break_value,
            };
            let decoded = ModemStatusParams::decode(&params.encode()).unwrap();
            assert_eq!(decoded, params);
        }
    }
}
