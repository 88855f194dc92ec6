use http::HeaderMap;
use http::header::CONTENT_TYPE;

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum MediaType {
    #[default]
    Json,
    Xml,
    FormUrlEncoded,
    PlainText,
    Html,
    Css,
    JavaScript,
    OctetStream,
    Custom(String),
}

impl MediaType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
            Self::FormUrlEncoded => "application/x-www-form-urlencoded",
            Self::PlainText => "text/plain",
            Self::Html => "text/html",
            Self::Css => "text/css",
            Self::JavaScript => "application/javascript",
            Self::OctetStream => "application/octet-stream",
            Self::Custom(value) => value.as_str(),
        }
    }

    pub fn parse(value: &str) -> Self {
        let essence = value
            .split(';')
            .next()
            .unwrap_or(value)
            .trim()
            .to_ascii_lowercase();
        match essence.as_str() {
            "application/json" => Self::Json,
            "application/xml" | "text/xml" => Self::Xml,
            "application/x-www-form-urlencoded" => Self::FormUrlEncoded,
            "text/plain" => Self::PlainText,
            "text/html" => Self::Html,
            "text/css" => Self::Css,
            "application/javascript" | "text/javascript" => Self::JavaScript,
            "application/octet-stream" => Self::OctetStream,
            _ => Self::Custom(value.trim().to_owned()),
        }
    }

    /// Static assets and downloads bypass the circuit breaker.
    pub fn is_static_asset(&self) -> bool {
        match self {
            Self::Html | Self::Css | Self::JavaScript | Self::OctetStream => true,
            Self::Custom(value) => {
                let value = value.to_ascii_lowercase();
                value.starts_with("image/")
                    || value.starts_with("font/")
                    || value.starts_with("audio/")
                    || value.starts_with("video/")
            }
            _ => false,
        }
    }
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

pub(crate) fn is_xml_content(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|value| value.to_str().ok()) else {
        return false;
    };
    let essence = value.split(';').next().unwrap_or(value).trim();
    essence.eq_ignore_ascii_case("application/xml")
        || essence.eq_ignore_ascii_case("text/xml")
        || essence.to_ascii_lowercase().ends_with("+xml")
}
