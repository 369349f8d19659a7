use std::collections::HashMap;
use std::fmt;

use url::Url;

/**
    Content types a stream can carry. This is a closed set: everything the
    pipeline captures, probes or serves maps into one of these, and anything
    else is rejected early.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentType {
    Hls,
    Mp4,
    Mkv,
    Webm,
    Avi,
    Mov,
    Mp2t,
}

impl ContentType {
    /// The canonical MIME string sent to devices and HTTP clients.
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Hls => "application/x-mpegURL",
            ContentType::Mp4 => "video/mp4",
            ContentType::Mkv => "video/x-matroska",
            ContentType::Webm => "video/webm",
            ContentType::Avi => "video/x-msvideo",
            ContentType::Mov => "video/quicktime",
            ContentType::Mp2t => "video/mp2t",
        }
    }

    /// Detect a content type from a URL's file extension.
    pub fn from_extension(url: &Url) -> Option<Self> {
        let path = url.path().to_ascii_lowercase();
        let ext = path.rsplit_once('.').map(|(_, e)| e)?;
        match ext {
            "m3u8" => Some(ContentType::Hls),
            "mp4" => Some(ContentType::Mp4),
            "mkv" => Some(ContentType::Mkv),
            "webm" => Some(ContentType::Webm),
            "avi" => Some(ContentType::Avi),
            "mov" => Some(ContentType::Mov),
            "ts" => Some(ContentType::Mp2t),
            _ => None,
        }
    }

    /// Detect a content type from a server-confirmed MIME type.
    pub fn from_mime(mime: &str) -> Option<Self> {
        match mime.to_ascii_lowercase().as_str() {
            "audio/mpegurl" | "audio/x-mpegurl" | "application/x-mpegurl"
            | "application/vnd.apple.mpegurl" => Some(ContentType::Hls),
            "video/mp4" => Some(ContentType::Mp4),
            "video/x-matroska" => Some(ContentType::Mkv),
            "video/webm" => Some(ContentType::Webm),
            "video/x-msvideo" => Some(ContentType::Avi),
            "video/quicktime" => Some(ContentType::Mov),
            "video/mp2t" => Some(ContentType::Mp2t),
            _ => None,
        }
    }

    /**
        Map an ffprobe `format_name` into the closed set. ffprobe reports a
        comma-separated list of candidate demuxers; the first recognized one
        wins.
    */
    pub fn from_probe_format(format: &str) -> Option<Self> {
        for f in format.split(',') {
            let ct = match f.trim() {
                "hls" | "applehttp" => Some(ContentType::Hls),
                "mp4" => Some(ContentType::Mp4),
                "matroska" => Some(ContentType::Mkv),
                "webm" => Some(ContentType::Webm),
                "avi" => Some(ContentType::Avi),
                "mov" => Some(ContentType::Mov),
                "mpegts" => Some(ContentType::Mp2t),
                _ => None,
            };
            if ct.is_some() {
                return ct;
            }
        }
        None
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime())
    }
}

/// An output container format the transcoder can produce.
#[derive(Debug, Clone, Copy)]
pub struct OutputFormat {
    pub content_type: ContentType,
    pub extension: &'static str,
}

/// Look up an ffmpeg output format name (the `-f` value).
pub fn lookup_output_format(name: &str) -> Option<OutputFormat> {
    match name {
        "mpegts" => Some(OutputFormat {
            content_type: ContentType::Mp2t,
            extension: ".ts",
        }),
        "mp4" => Some(OutputFormat {
            content_type: ContentType::Mp4,
            extension: ".mp4",
        }),
        "matroska" => Some(OutputFormat {
            content_type: ContentType::Mkv,
            extension: ".mkv",
        }),
        "webm" => Some(OutputFormat {
            content_type: ContentType::Webm,
            extension: ".webm",
        }),
        _ => None,
    }
}

/**
    ffmpeg/ffprobe flags that relax extension checks for HLS playlists, so
    proxied manifests without a `.m3u8` suffix still demux.
*/
pub const HLS_INPUT_ARGS: &[&str] = &[
    "-allowed_extensions",
    "ALL",
    "-allowed_segment_extensions",
    "ALL",
    "-extension_picky",
    "0",
    "-seg_format_options",
    "extension_picky=0",
];

/// A media stream: where it lives, how to request it, what it carries.
#[derive(Debug, Clone)]
pub struct Stream {
    pub url: Url,
    pub headers: HashMap<String, String>,
    pub content_type: Option<ContentType>,
    /// Bits per second; 0 when unknown.
    pub bandwidth: u64,
}

impl Stream {
    pub fn new(url: Url) -> Self {
        let content_type = ContentType::from_extension(&url);
        Self {
            url,
            headers: HashMap::new(),
            content_type,
            bandwidth: 0,
        }
    }
}

/**
    Format headers into the single `-headers` block ffmpeg and ffprobe expect:
    `Key: Value\r\n` pairs. HTTP/2 pseudo-headers (`:method`, `:path`, …) are
    dropped; Chrome reports them alongside real request headers.
*/
pub fn format_http_headers(headers: &HashMap<String, String>) -> String {
    let mut out = String::new();
    for (k, v) in headers {
        if k.starts_with(':') {
            continue;
        }
        out.push_str(k);
        out.push_str(": ");
        out.push_str(v);
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_from_extension() {
        let url = Url::parse("http://host/video/file.MP4?token=1").unwrap();
        assert_eq!(ContentType::from_extension(&url), Some(ContentType::Mp4));

        let url = Url::parse("http://host/hls/master.m3u8").unwrap();
        assert_eq!(ContentType::from_extension(&url), Some(ContentType::Hls));

        let url = Url::parse("http://host/page").unwrap();
        assert_eq!(ContentType::from_extension(&url), None);
    }

    #[test]
    fn detect_from_mime() {
        assert_eq!(
            ContentType::from_mime("application/vnd.apple.mpegURL"),
            Some(ContentType::Hls)
        );
        assert_eq!(ContentType::from_mime("video/webm"), Some(ContentType::Webm));
        assert_eq!(ContentType::from_mime("text/html"), None);
    }

    #[test]
    fn probe_format_takes_first_recognized() {
        assert_eq!(
            ContentType::from_probe_format("mov,mp4,m4a,3gp,3g2,mj2"),
            Some(ContentType::Mov)
        );
        assert_eq!(
            ContentType::from_probe_format("hls"),
            Some(ContentType::Hls)
        );
        assert_eq!(ContentType::from_probe_format("gif"), None);
    }

    #[test]
    fn output_format_registry() {
        let fmt = lookup_output_format("mpegts").unwrap();
        assert_eq!(fmt.content_type, ContentType::Mp2t);
        assert_eq!(fmt.extension, ".ts");
        assert!(lookup_output_format("ogg").is_none());
    }

    #[test]
    fn header_block_skips_pseudo_headers() {
        let mut headers = HashMap::new();
        headers.insert(":method".to_string(), "GET".to_string());
        headers.insert("Referer".to_string(), "http://origin/".to_string());

        let block = format_http_headers(&headers);
        assert_eq!(block, "Referer: http://origin/\r\n");
    }
}
