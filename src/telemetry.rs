//! Result telemetry
//!
//! Each record is one line `<topic> <json>` on the output stream, with the
//! topic formed from the run prefix and a per-record suffix. Reporting is
//! best-effort: records that cannot be formatted or written are logged and
//! dropped.
use std::io::Write;

use heapless::String;
use serde::Serialize;

/// Maximum encoded payload size.
const PAYLOAD_SIZE: usize = 2048;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("topic too long")]
    Topic,
    #[error("payload encoding: {0:?}")]
    Encode(serde_json_core::ser::Error),
    #[error("output: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TelemetryClient<W: Write> {
    out: W,
    prefix: String<64>,
}

impl<W: Write> TelemetryClient<W> {
    /// Construct a new telemetry client.
    ///
    /// # Args
    /// * `out` - Destination of the records
    /// * `prefix` - Topic prefix, e.g. `QTD/VDGG/qtd-0W`
    pub fn new(out: W, prefix: String<64>) -> Self {
        Self { out, prefix }
    }

    /// Publish `telemetry` under `<prefix><suffix>`, logging failures.
    pub fn publish_telemetry<T: Serialize>(
        &mut self,
        suffix: &str,
        telemetry: &T,
    ) {
        let mut topic: String<128> = String::new();
        let result = if topic.push_str(&self.prefix).is_ok()
            && topic.push_str(suffix).is_ok()
        {
            self.publish(&topic, telemetry)
        } else {
            Err(PublishError::Topic)
        };
        result
            .map_err(|e| log::error!("Telemetry publishing error: {e}"))
            .ok();
    }

    pub fn publish<T: Serialize>(
        &mut self,
        topic: &str,
        payload: &T,
    ) -> Result<(), PublishError> {
        let mut buf = [0; PAYLOAD_SIZE];
        let len = serde_json_core::to_slice(payload, &mut buf)
            .map_err(PublishError::Encode)?;
        write!(self.out, "{topic} ")?;
        self.out.write_all(&buf[..len])?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Rate {
        rate: u32,
    }

    #[test]
    fn lines() {
        let mut client =
            TelemetryClient::new(Vec::<u8>::new(), String::try_from("QTD/test").unwrap());
        client.publish_telemetry("/rate", &Rate { rate: 42 });
        client.publish_telemetry("/counts", &[1u32, 2, 3]);
        let out = client.into_inner();
        assert_eq!(
            core::str::from_utf8(&out).unwrap(),
            "QTD/test/rate {\"rate\":42}\nQTD/test/counts [1,2,3]\n"
        );
    }

    #[test]
    fn long_topic_dropped() {
        let prefix = String::try_from("x".repeat(64).as_str()).unwrap();
        let mut client = TelemetryClient::new(Vec::<u8>::new(), prefix);
        client.publish_telemetry(&"y".repeat(65), &Rate { rate: 1 });
        assert!(client.into_inner().is_empty());
    }
}
