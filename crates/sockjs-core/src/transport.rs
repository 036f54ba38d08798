use bytes::Bytes;

use crate::frame::{js_literal, Frame};

/// Size of the throwaway block streamed before the first xhr_streaming
/// frame, so proxies and browser buffers flush.
pub const STREAMING_PRELUDE_LEN: usize = 2048;

/// Minimum size of the htmlfile bootstrap document; browsers only start
/// parsing an iframe document past roughly 1 KiB.
const HTMLFILE_MIN_LEN: usize = 1024;

const HTMLFILE_TEMPLATE: &str = r#"<!doctype html>
<html><head>
  <meta http-equiv="X-UA-Compatible" content="IE=edge" />
  <meta http-equiv="Content-Type" content="text/html; charset=UTF-8" />
</head><body><h2>Don't panic!</h2>
  <script>
    document.domain = document.domain;
    var c = parent.{{callback}};
    c.start();
    function p(d) {c.message(d);};
    window.onload = function() {c.stop();};
  </script>"#;

/// One concrete encoding of the session's frames. The kind is fixed at
/// routing time and never changes for a request's lifetime; session logic
/// only touches it through this capability table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    XhrPolling,
    XhrStreaming,
    EventSource,
    HtmlFile,
    Jsonp,
    Websocket,
}

impl Transport {
    /// Map a URL transport segment to its kind. The send-class segments
    /// (`xhr_send`, `jsonp_send`) are routed separately and return None.
    pub fn from_segment(segment: &str) -> Option<Self> {
        match segment {
            "xhr" => Some(Self::XhrPolling),
            "xhr_streaming" => Some(Self::XhrStreaming),
            "eventsource" => Some(Self::EventSource),
            "htmlfile" => Some(Self::HtmlFile),
            "jsonp" => Some(Self::Jsonp),
            "websocket" => Some(Self::Websocket),
            _ => None,
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::XhrPolling | Self::XhrStreaming | Self::Jsonp => {
                "application/javascript; charset=UTF-8"
            }
            Self::EventSource => "text/event-stream; charset=UTF-8",
            Self::HtmlFile => "text/html; charset=UTF-8",
            Self::Websocket => "",
        }
    }

    /// Streaming transports hold one response open across many frames;
    /// one-shot transports close the response after a single frame.
    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::XhrStreaming | Self::EventSource | Self::HtmlFile)
    }

    /// Whether the client must supply a `c` callback query parameter.
    pub fn needs_callback(&self) -> bool {
        matches!(self, Self::HtmlFile | Self::Jsonp)
    }

    /// Filler written before the first frame of a streaming response.
    pub fn prelude(&self, callback: &str) -> Option<Bytes> {
        match self {
            Self::XhrStreaming => {
                let mut block = vec![b'h'; STREAMING_PRELUDE_LEN];
                block.push(b'\n');
                Some(Bytes::from(block))
            }
            Self::EventSource => Some(Bytes::from_static(b"\r\n")),
            Self::HtmlFile => {
                let mut doc = HTMLFILE_TEMPLATE.replace("{{callback}}", callback);
                while doc.len() < HTMLFILE_MIN_LEN {
                    doc.push(' ');
                }
                doc.push_str("\r\n\r\n");
                Some(Bytes::from(doc))
            }
            _ => None,
        }
    }

    /// Wrap a frame in this transport's wire form.
    pub fn encode(&self, frame: &Frame, callback: &str) -> Bytes {
        let wire = frame.render();
        let encoded = match self {
            Self::XhrPolling | Self::XhrStreaming => format!("{wire}\n"),
            Self::EventSource => format!("data: {wire}\r\n\r\n"),
            Self::HtmlFile => format!("<script>\np({});\n</script>\r\n", js_literal(&wire)),
            Self::Jsonp => format!("/**/{callback}({});\r\n", js_literal(&wire)),
            Self::Websocket => wire,
        };
        Bytes::from(encoded)
    }
}
