//! SOAP envelopes and DIDL-Lite metadata.
//!
//! Requests are rendered by hand; responses are parsed with `roxmltree` and
//! matched on local names, so namespace prefixes chosen by the device do not
//! matter.
//!
//! A response to `TransportState` looks like:
//!
//! ```xml
//! <s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
//!   <s:Body>
//!     <u:TransportStateResponse xmlns:u="urn:av-openhome-org:service:Playlist:1">
//!       <Value>Playing</Value>
//!     </u:TransportStateResponse>
//!   </s:Body>
//! </s:Envelope>
//! ```

use bridge_traits::StreamItem;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{OpenHomeError, Result};

const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const ENCODING_STYLE: &str = "http://schemas.xmlsoap.org/soap/encoding/";

/// One action invocation on an OpenHome service.
#[derive(Debug, Clone)]
pub struct SoapAction<'a> {
    pub service: &'a str,
    pub action: &'a str,
    pub args: &'a [(&'a str, &'a str)],
}

impl<'a> SoapAction<'a> {
    pub fn new(service: &'a str, action: &'a str, args: &'a [(&'a str, &'a str)]) -> Self {
        Self {
            service,
            action,
            args,
        }
    }

    pub fn service_type(&self) -> String {
        format!("urn:av-openhome-org:service:{}:1", self.service)
    }

    /// Value of the `SOAPACTION` header.
    pub fn header(&self) -> String {
        format!("\"{}#{}\"", self.service_type(), self.action)
    }

    pub fn envelope(&self) -> String {
        let args: String = self
            .args
            .iter()
            .map(|(name, value)| format!("<{0}>{1}</{0}>", name, escape_xml(value)))
            .collect();

        format!(
            concat!(
                r#"<?xml version="1.0" encoding="utf-8"?>"#,
                r#"<s:Envelope xmlns:s="{ns}" s:encodingStyle="{enc}">"#,
                r#"<s:Body><u:{action} xmlns:u="{service}">{args}</u:{action}></s:Body>"#,
                r#"</s:Envelope>"#
            ),
            ns = ENVELOPE_NS,
            enc = ENCODING_STYLE,
            action = self.action,
            service = self.service_type(),
            args = args
        )
    }
}

pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Output arguments of `{action}Response`, unescaped.
pub fn parse_response(body: &str, action: &str) -> Result<HashMap<String, String>> {
    let doc = roxmltree::Document::parse(body)
        .map_err(|e| OpenHomeError::MalformedResponse(format!("XML parse error: {}", e)))?;

    let expected = format!("{}Response", action);
    let response = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == expected)
        .ok_or_else(|| OpenHomeError::MalformedResponse(format!("no <{}> element", expected)))?;

    Ok(response
        .children()
        .filter(|n| n.is_element())
        .map(|n| {
            (
                n.tag_name().name().to_string(),
                n.text().unwrap_or_default().to_string(),
            )
        })
        .collect())
}

/// `(errorCode, errorDescription)` of a UPnP fault, if the body is one.
pub fn parse_fault(body: &str) -> Option<(String, String)> {
    let doc = roxmltree::Document::parse(body).ok()?;
    let text_of = |name: &str| {
        doc.descendants()
            .find(|n| n.is_element() && n.tag_name().name() == name)
            .and_then(|n| n.text())
            .map(|t| t.trim().to_string())
    };

    match (text_of("errorCode"), text_of("errorDescription")) {
        (Some(code), description) => Some((code, description.unwrap_or_default())),
        (None, _) => text_of("faultstring").map(|fault| ("0".to_string(), fault)),
    }
}

/// DIDL-Lite description of a stream, as sent with `Insert`.
pub fn didl_lite(item: &StreamItem) -> String {
    format!(
        concat!(
            r#"<DIDL-Lite xmlns="urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/" "#,
            r#"xmlns:dc="http://purl.org/dc/elements/1.1/" "#,
            r#"xmlns:upnp="urn:schemas-upnp-org:metadata-1-0/upnp/">"#,
            r#"<item id="{id}" parentID="-1" restricted="1">"#,
            r#"<dc:title>{title}</dc:title>"#,
            r#"<upnp:class>object.item.audioItem.musicTrack</upnp:class>"#,
            r#"<res duration="{duration}" protocolInfo="http-get:*:*:*">{uri}</res>"#,
            r#"</item></DIDL-Lite>"#
        ),
        id = escape_xml(&item.track_id),
        title = escape_xml(&item.title),
        duration = didl_duration(item.duration),
        uri = escape_xml(&item.uri)
    )
}

/// First `<res>` of a DIDL-Lite document.
pub fn didl_resource(didl: &str) -> Option<String> {
    let doc = roxmltree::Document::parse(didl).ok()?;
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "res")
        .and_then(|n| n.text())
        .map(|uri| uri.trim().to_string())
        .filter(|uri| !uri.is_empty())
}

/// `H:MM:SS.mmm`
fn didl_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!(
        "{}:{:02}:{:02}.{:03}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        duration.subsec_millis()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_escapes_arguments() {
        let args = [("Uri", "https://cdn/a.flac?x=1&y=<2>")];
        let action = SoapAction::new("Playlist", "Insert", &args);

        let envelope = action.envelope();
        assert!(envelope.contains(r#"<u:Insert xmlns:u="urn:av-openhome-org:service:Playlist:1">"#));
        assert!(envelope.contains("<Uri>https://cdn/a.flac?x=1&amp;y=&lt;2&gt;</Uri>"));
        assert_eq!(action.header(), "\"urn:av-openhome-org:service:Playlist:1#Insert\"");

        // Round trip through a real parser
        let doc = roxmltree::Document::parse(&envelope).unwrap();
        let uri = doc
            .descendants()
            .find(|n| n.tag_name().name() == "Uri")
            .and_then(|n| n.text())
            .unwrap();
        assert_eq!(uri, "https://cdn/a.flac?x=1&y=<2>");
    }

    #[test]
    fn test_parse_response_ignores_prefixes() {
        let body = r#"<?xml version="1.0"?>
            <soap:Envelope xmlns:soap="http://schemas.xmlsoap.org/soap/envelope/">
              <soap:Body>
                <m:TimeResponse xmlns:m="urn:av-openhome-org:service:Time:1">
                  <TrackCount>3</TrackCount>
                  <Duration>379</Duration>
                  <Seconds>42</Seconds>
                </m:TimeResponse>
              </soap:Body>
            </soap:Envelope>"#;

        let out = parse_response(body, "Time").unwrap();
        assert_eq!(out.get("Seconds").map(String::as_str), Some("42"));
        assert_eq!(out.len(), 3);

        assert!(matches!(
            parse_response(body, "Id"),
            Err(OpenHomeError::MalformedResponse(_))
        ));
        assert!(parse_response("not xml", "Time").is_err());
    }

    #[test]
    fn test_parse_fault() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body>
            <s:Fault><faultcode>s:Client</faultcode><faultstring>UPnPError</faultstring>
            <detail><UPnPError xmlns="urn:schemas-upnp-org:control-1-0">
              <errorCode>801</errorCode><errorDescription>Playlist full</errorDescription>
            </UPnPError></detail></s:Fault></s:Body></s:Envelope>"#;

        assert_eq!(
            parse_fault(body),
            Some(("801".to_string(), "Playlist full".to_string()))
        );
        assert_eq!(parse_fault("<html>oops</html>"), None);
    }

    #[test]
    fn test_didl_round_trip() {
        let item = StreamItem {
            track_id: "58990486".to_string(),
            uri: "https://cdn/a.flac?token=1&q=2".to_string(),
            title: "Massive Attack - Angel".to_string(),
            duration: Duration::from_millis(379_250),
        };

        let didl = didl_lite(&item);
        assert!(didl.contains(r#"duration="0:06:19.250""#));
        assert_eq!(didl_resource(&didl).as_deref(), Some("https://cdn/a.flac?token=1&q=2"));
        assert_eq!(didl_resource("<DIDL-Lite/>"), None);
    }
}
