//! Test command, GSM 07.10 5.4.6.3.4
//!
//! Carries an arbitrary pattern that the peer must echo back unchanged.

use rfcomm_core::RfcommResult;

#[derive(Debug, Clone, PartialEq)]
pub struct TestCommandParams {
    pub test_data: Vec<u8>,
}

impl TestCommandParams {
    pub fn decode(buf: &[u8]) -> RfcommResult<Self> {
        Ok(Self { test_data: buf.to_vec() })
    }

    pub fn encode(&self) -> Vec<u8> {
        self.test_data.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for data in [vec![], vec![0xDE, 0xAD, 0xBE, 0xEF]] {
            let params = TestCommandParams { test_data: data };
            assert_eq!(TestCommandParams::decode(&params.encode()).unwrap(), params);
        }
    }
}
