use anyhow::{Context, Result, anyhow};
use sxd_xpath::{Context as XPathContext, Factory, Value};
use tracing::debug;
use url::Url;

use super::DeviceInfo;
use crate::media::ContentType;

/// Content types DLNA renderers are driven with directly.
pub const SUPPORTED_CONTENT_TYPES: &[ContentType] = &[ContentType::Mp2t, ContentType::Mp4];

const AVTRANSPORT_SERVICE: &str = "urn:schemas-upnp-org:service:AVTransport:1";

/**
    A UPnP/DLNA media renderer, driven over its AVTransport service:
    `SetAVTransportURI` with DIDL-Lite metadata, then `Play`.
*/
pub struct DlnaDevice {
    info: DeviceInfo,
    control_url: Option<Url>,
    client: reqwest::Client,
}

/// Parsed bits of a UPnP device description document.
pub struct Description {
    pub friendly_name: String,
    /// AVTransport control URL, possibly relative to the description URL.
    pub control_url: String,
}

impl DlnaDevice {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            control_url: None,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch the device description and resolve the AVTransport control URL.
    pub async fn connect(&mut self) -> Result<()> {
        let description = fetch_description(&self.info.address).await?;

        let base = Url::parse(&self.info.address)
            .with_context(|| format!("parsing device location {:?}", self.info.address))?;
        let control_url = base
            .join(&description.control_url)
            .with_context(|| format!("resolving control URL {:?}", description.control_url))?;

        debug!(control_url = %control_url, "avtransport control resolved");
        self.control_url = Some(control_url);
        Ok(())
    }

    pub async fn play(&self, stream_url: &Url, content_type: ContentType) -> Result<()> {
        let control_url = self
            .control_url
            .as_ref()
            .ok_or_else(|| anyhow!("device not connected"))?;

        let metadata = build_didl_metadata(stream_url, content_type);
        debug!(url = %stream_url, "setting avtransport uri");

        self.soap_call(
            control_url,
            "SetAVTransportURI",
            &format!(
                "<InstanceID>0</InstanceID>\
                 <CurrentURI>{}</CurrentURI>\
                 <CurrentURIMetaData>{}</CurrentURIMetaData>",
                xml_escape(stream_url.as_str()),
                xml_escape(&metadata),
            ),
        )
        .await
        .context("setting transport URI")?;

        debug!("sending play command");
        self.soap_call(
            control_url,
            "Play",
            "<InstanceID>0</InstanceID><Speed>1</Speed>",
        )
        .await
        .context("starting playback")?;

        Ok(())
    }

    pub fn close(&mut self) {
        self.control_url = None;
    }

    async fn soap_call(&self, control_url: &Url, action: &str, arguments: &str) -> Result<()> {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
             <s:Envelope xmlns:s=\"http://schemas.xmlsoap.org/soap/envelope/\" \
             s:encodingStyle=\"http://schemas.xmlsoap.org/soap/encoding/\">\
             <s:Body><u:{action} xmlns:u=\"{service}\">{arguments}</u:{action}></s:Body>\
             </s:Envelope>",
            action = action,
            service = AVTRANSPORT_SERVICE,
            arguments = arguments,
        );

        let response = self
            .client
            .post(control_url.clone())
            .header("Content-Type", r#"text/xml; charset="utf-8""#)
            .header("SOAPACTION", format!("\"{AVTRANSPORT_SERVICE}#{action}\""))
            .body(envelope)
            .send()
            .await
            .with_context(|| format!("sending {action}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{action} failed with status {status}: {body}"));
        }
        Ok(())
    }
}

/// Fetch and parse a UPnP device description document.
pub async fn fetch_description(location: &str) -> Result<Description> {
    let body = reqwest::get(location)
        .await
        .with_context(|| format!("fetching device description {location}"))?
        .error_for_status()
        .context("device description status")?
        .text()
        .await
        .context("reading device description")?;

    parse_description(&body)
}

fn parse_description(xml: &str) -> Result<Description> {
    let package = sxd_document::parser::parse(xml)
        .map_err(|e| anyhow!("parsing device description: {e:?}"))?;
    let document = package.as_document();

    let friendly_name = xpath_string(
        document.root(),
        "//*[local-name()='device']/*[local-name()='friendlyName']",
    )?
    .ok_or_else(|| anyhow!("description has no friendlyName"))?;

    let control_url = xpath_string(
        document.root(),
        "//*[local-name()='service']\
         [contains(*[local-name()='serviceType'], 'AVTransport')]\
         /*[local-name()='controlURL']",
    )?
    .ok_or_else(|| anyhow!("no AVTransport service in description"))?;

    Ok(Description {
        friendly_name,
        control_url,
    })
}

fn xpath_string<'d, N>(node: N, path: &str) -> Result<Option<String>>
where
    N: Into<sxd_xpath::nodeset::Node<'d>>,
{
    let factory = Factory::new();
    let xpath = factory
        .build(path)
        .map_err(|e| anyhow!("invalid xpath {path:?}: {e:?}"))?
        .ok_or_else(|| anyhow!("empty xpath {path:?}"))?;

    let context = XPathContext::new();
    let value = xpath
        .evaluate(&context, node)
        .map_err(|e| anyhow!("xpath evaluation failed: {e:?}"))?;

    let text = match value {
        Value::Nodeset(nodes) => match nodes.document_order_first() {
            Some(node) => node.string_value(),
            None => return Ok(None),
        },
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        Value::Boolean(b) => b.to_string(),
    };

    let text = text.trim().to_string();
    Ok((!text.is_empty()).then_some(text))
}

/// The DLNA profile name for a content type, when one exists.
fn profile_name(content_type: ContentType) -> Option<&'static str> {
    match content_type {
        ContentType::Mp2t => Some("MPEG_TS_HD_NA"),
        ContentType::Mp4 => Some("AVC_MP4_HP_HD_AAC"),
        _ => None,
    }
}

/// The `contentFeatures.dlna.org` value for a content type.
pub fn content_features(content_type: ContentType) -> String {
    const TAIL: &str =
        "DLNA.ORG_OP=00;DLNA.ORG_CI=1;DLNA.ORG_FLAGS=21700000000000000000000000000000";
    match profile_name(content_type) {
        Some(pn) => format!("DLNA.ORG_PN={pn};{TAIL}"),
        None => TAIL.to_string(),
    }
}

/**
    HTTP headers a DLNA renderer expects on a live stream response: an
    effectively-infinite length, no ranges, and streaming transfer mode.
*/
pub fn stream_headers(content_type: ContentType) -> Vec<(String, String)> {
    vec![
        ("Content-Length".to_string(), i64::MAX.to_string()),
        ("Accept-Ranges".to_string(), "none".to_string()),
        ("transferMode.dlna.org".to_string(), "Streaming".to_string()),
        (
            "contentFeatures.dlna.org".to_string(),
            content_features(content_type),
        ),
    ]
}

/// DIDL-Lite metadata envelope for `SetAVTransportURI`.
fn build_didl_metadata(stream_url: &Url, content_type: ContentType) -> String {
    let protocol_info = format!(
        "http-get:*:{}:DLNA.ORG_OP=00;DLNA.ORG_CI=1;DLNA.ORG_FLAGS=01700000000000000000000000000000",
        content_type.mime()
    );

    format!(
        "<DIDL-Lite xmlns=\"urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/\" \
         xmlns:dc=\"http://purl.org/dc/elements/1.1/\" \
         xmlns:upnp=\"urn:schemas-upnp-org:metadata-1-0/upnp/\">\
         <item id=\"0\" parentID=\"-1\" restricted=\"1\">\
         <dc:title>Beamer Stream</dc:title>\
         <upnp:class>object.item.videoItem</upnp:class>\
         <res protocolInfo=\"{}\">{}</res>\
         </item></DIDL-Lite>",
        xml_escape(&protocol_info),
        xml_escape(stream_url.as_str()),
    )
}

fn xml_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
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

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTION: &str = r#"<?xml version="1.0"?>
<root xmlns="urn:schemas-upnp-org:device-1-0">
  <device>
    <deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>
    <friendlyName>Living Room TV</friendlyName>
    <serviceList>
      <service>
        <serviceType>urn:schemas-upnp-org:service:RenderingControl:1</serviceType>
        <controlURL>/RenderingControl/ctrl</controlURL>
      </service>
      <service>
        <serviceType>urn:schemas-upnp-org:service:AVTransport:1</serviceType>
        <controlURL>/AVTransport/ctrl</controlURL>
      </service>
    </serviceList>
  </device>
</root>"#;

    #[test]
    fn parses_friendly_name_and_control_url() {
        let description = parse_description(DESCRIPTION).unwrap();
        assert_eq!(description.friendly_name, "Living Room TV");
        assert_eq!(description.control_url, "/AVTransport/ctrl");
    }

    #[test]
    fn missing_avtransport_is_an_error() {
        let xml = DESCRIPTION.replace("AVTransport", "OtherService");
        assert!(parse_description(&xml).is_err());
    }

    #[test]
    fn content_features_by_profile() {
        assert_eq!(
            content_features(ContentType::Mp2t),
            "DLNA.ORG_PN=MPEG_TS_HD_NA;DLNA.ORG_OP=00;DLNA.ORG_CI=1;DLNA.ORG_FLAGS=21700000000000000000000000000000"
        );
        assert_eq!(
            content_features(ContentType::Mp4),
            "DLNA.ORG_PN=AVC_MP4_HP_HD_AAC;DLNA.ORG_OP=00;DLNA.ORG_CI=1;DLNA.ORG_FLAGS=21700000000000000000000000000000"
        );
        // No profile for other types; the tail stands alone.
        assert!(!content_features(ContentType::Webm).contains("DLNA.ORG_PN"));
    }

    #[test]
    fn stream_headers_carry_dlna_contract() {
        let headers = stream_headers(ContentType::Mp2t);
        let get = |name: &str| {
            headers
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
                .unwrap()
        };
        assert_eq!(get("Content-Length"), "9223372036854775807");
        assert_eq!(get("Accept-Ranges"), "none");
        assert_eq!(get("transferMode.dlna.org"), "Streaming");
        assert!(get("contentFeatures.dlna.org").starts_with("DLNA.ORG_PN=MPEG_TS_HD_NA"));
    }

    #[test]
    fn didl_metadata_escapes_the_stream_url() {
        let url = Url::parse("http://10.0.0.2:9000/stream.ts?a=1&b=2").unwrap();
        let didl = build_didl_metadata(&url, ContentType::Mp2t);
        assert!(didl.contains("http://10.0.0.2:9000/stream.ts?a=1&amp;b=2"));
        assert!(didl.contains("object.item.videoItem"));
        assert!(didl.contains("http-get:*:video/mp2t:"));
    }
}
