use crate::core::{Result, SignalError};
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::Client;
use std::time::Duration;

/// Query string of a control request: `{parameter}&speech={message}`, with
/// either side left out when empty. `None` when there is nothing to send.
pub fn control_query(parameter: &str, message: &str) -> Option<String> {
    let speech = if message.is_empty() {
        String::new()
    } else {
        format!("speech={}", message)
    };
    match (parameter.is_empty(), speech.is_empty()) {
        (true, true) => None,
        (false, true) => Some(parameter.to_string()),
        (true, false) => Some(speech),
        (false, false) => Some(format!("{}&{}", parameter, speech)),
    }
}

/// Reads the `value` attribute of `<sound name="SOUND">` in a status
/// document. `"0"` means the device is idle.
pub fn parse_sound_idle(xml: &str) -> Result<bool> {
    let malformed = |e: &dyn std::fmt::Display| {
        SignalError::DeliveryError(format!("malformed status document: {}", e))
    };
    let mut reader = Reader::from_str(xml);
    loop {
        let element = match reader.read_event().map_err(|e| malformed(&e))? {
            Event::Start(element) | Event::Empty(element) => element,
            Event::Eof => break,
            _ => continue,
        };
        if element.name().as_ref() != b"sound" {
            continue;
        }

        let mut name = None;
        let mut value = None;
        for attr in element.attributes() {
            let attr = attr.map_err(|e| malformed(&e))?;
            let text = attr.unescape_value().map_err(|e| malformed(&e))?;
            match attr.key.as_ref() {
                b"name" => name = Some(text.into_owned()),
                b"value" => value = Some(text.into_owned()),
                _ => {}
            }
        }
        if name.as_deref() == Some("SOUND") {
            return value.map(|v| v.trim() == "0").ok_or_else(|| {
                SignalError::DeliveryError("SOUND element has no value".to_string())
            });
        }
    }
    Err(SignalError::DeliveryError(
        "status document has no SOUND element".to_string(),
    ))
}

/// The HTTP surface of an announcer device.
#[async_trait]
pub trait Announcer: Send + Sync {
    /// Issues `/api/control?{query}` and returns the response body.
    async fn control(&self, address: &str, query: &str) -> Result<String>;

    /// Polls `/api/status` and reports whether the device is silent.
    async fn is_idle(&self, address: &str) -> Result<bool>;
}

/// Talks to real devices with `reqwest`.
#[derive(Clone)]
pub struct HttpAnnouncer {
    client: Client,
}

impl HttpAnnouncer {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SignalError::ConfigError(format!("http client: {}", e)))?;
        Ok(Self { client })
    }

    async fn get_text(&self, url: &str) -> Result<String> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(SignalError::DeliveryError(format!(
                "{} answered {}",
                url,
                resp.status()
            )));
        }
        Ok(resp.text().await?)
    }
}

#[async_trait]
impl Announcer for HttpAnnouncer {
    async fn control(&self, address: &str, query: &str) -> Result<String> {
        self.get_text(&format!("http://{}/api/control?{}", address, query))
            .await
    }

    async fn is_idle(&self, address: &str) -> Result<bool> {
        let body = self
            .get_text(&format!("http://{}/api/status?format=xml", address))
            .await?;
        parse_sound_idle(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_query() {
        assert_eq!(control_query("", ""), None);
        assert_eq!(control_query("led=red", ""), Some("led=red".to_string()));
        assert_eq!(control_query("", "Hello"), Some("speech=Hello".to_string()));
        assert_eq!(
            control_query("led=red&beep=1", "Hello"),
            Some("led=red&beep=1&speech=Hello".to_string())
        );
    }

    #[test]
    fn test_parse_sound_idle() {
        let idle = r#"<?xml version="1.0"?>
            <status>
              <led name="LED1" value="1"/>
              <sound name="SOUND" value="0" />
            </status>"#;
        assert!(parse_sound_idle(idle).unwrap());

        let busy = r#"<status><sound value='2' name='SOUND'></sound></status>"#;
        assert!(!parse_sound_idle(busy).unwrap());

        let other = r#"<status><sound name="BUZZER" value="0"/></status>"#;
        assert!(parse_sound_idle(other).is_err());
        assert!(parse_sound_idle("not xml").is_err());
    }

    #[test]
    fn test_parse_sound_idle_reads_real_markup_only() {
        let commented = r#"<status>
              <!-- <sound name="SOUND" value="0"/> -->
              <sound name="SOUND" value="3"/>
            </status>"#;
        assert!(!parse_sound_idle(commented).unwrap());

        let cdata = r#"<status><![CDATA[<sound name="SOUND" value="0"/>]]><sound name="SOUND" value="1"/></status>"#;
        assert!(!parse_sound_idle(cdata).unwrap());

        let escaped = r#"<status><sound name="&#83;OUND" value="&#48;"/></status>"#;
        assert!(parse_sound_idle(escaped).unwrap());
    }
}
