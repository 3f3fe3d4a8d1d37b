use std_alloc::string::String;
use std_alloc::vec::Vec;

/// Content-Format
///
/// The numeric registry of media types carried by the Content-Format
/// and Accept options ([RFC7252 section 12.3](https://datatracker.ietf.org/doc/html/rfc7252#section-12.3)).
///
/// The image formats (21-23) were registered by early CoAP deployments
/// and are kept here so that [`ContentFormat::is_image`] has something
/// to say yes to.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContentFormat {
  /// `text/plain; charset=utf-8`
  Text,
  /// `image/gif`
  Gif,
  /// `image/jpeg`
  Jpeg,
  /// `image/png`
  Png,
  /// `application/link-format`
  LinkFormat,
  /// `application/xml`
  Xml,
  /// `application/octet-stream`
  OctetStream,
  /// `application/exi`
  Exi,
  /// `application/json`
  Json,
  /// Another content format
  Other(u16),
}

impl ContentFormat {
  /// Convert this content format to the CoAP byte value
  pub fn bytes(&self) -> [u8; 2] {
    u16::from(self).to_be_bytes()
  }

  /// The MIME name of this content format.
  ///
  /// Unknown formats render as `unknown/<n>`.
  ///
  /// ```
  /// use newt_msg::ContentFormat;
  ///
  /// assert_eq!(ContentFormat::Json.name(), "application/json");
  /// assert_eq!(ContentFormat::Other(1234).name(), "unknown/1234");
  /// ```
  pub fn name(&self) -> String {
    use ContentFormat::*;
    match *self {
      | Text => "text/plain; charset=utf-8".into(),
      | Gif => "image/gif".into(),
      | Jpeg => "image/jpeg".into(),
      | Png => "image/png".into(),
      | LinkFormat => "application/link-format".into(),
      | Xml => "application/xml".into(),
      | OctetStream => "application/octet-stream".into(),
      | Exi => "application/exi".into(),
      | Json => "application/json".into(),
      | Other(n) => std_alloc::format!("unknown/{}", n),
    }
  }

  /// The customary file extension for this format, or None when unknown
  pub fn file_extension(&self) -> Option<&'static str> {
    use ContentFormat::*;
    match *self {
      | Text => Some("txt"),
      | Gif => Some("gif"),
      | Jpeg => Some("jpg"),
      | Png => Some("png"),
      | LinkFormat => Some("wlnk"),
      | Xml => Some("xml"),
      | OctetStream => Some("bin"),
      | Exi => Some("exi"),
      | Json => Some("json"),
      | Other(_) => None,
    }
  }

  /// Can a payload of this format be shown to a human as text?
  pub fn is_printable(&self) -> bool {
    use ContentFormat::*;
    matches!(*self, Text | LinkFormat | Xml | Json)
  }

  /// Is this an image format?
  pub fn is_image(&self) -> bool {
    use ContentFormat::*;
    matches!(*self, Gif | Jpeg | Png)
  }

  /// Look a format up by its MIME name.
  ///
  /// Returns None for names this registry doesn't know.
  ///
  /// ```
  /// use newt_msg::ContentFormat;
  ///
  /// assert_eq!(ContentFormat::parse("application/json"), Some(ContentFormat::Json));
  /// assert_eq!(ContentFormat::parse("application/x-frobnicate"), None);
  /// ```
  pub fn parse(mime: &str) -> Option<Self> {
    use ContentFormat::*;
    match mime {
      | "text/plain" | "text/plain; charset=utf-8" | "text/plain;charset=utf-8" => Some(Text),
      | "image/gif" => Some(Gif),
      | "image/jpeg" => Some(Jpeg),
      | "image/png" => Some(Png),
      | "application/link-format" => Some(LinkFormat),
      | "application/xml" => Some(Xml),
      | "application/octet-stream" => Some(OctetStream),
      | "application/exi" => Some(Exi),
      | "application/json" => Some(Json),
      | _ => None,
    }
  }

  /// All known formats matching a `type/*` wildcard (or one exact name).
  ///
  /// ```
  /// use newt_msg::ContentFormat;
  ///
  /// assert_eq!(ContentFormat::parse_wildcard("image/*"),
  ///            vec![ContentFormat::Gif, ContentFormat::Jpeg, ContentFormat::Png]);
  /// assert!(ContentFormat::parse_wildcard("video/*").is_empty());
  /// ```
  pub fn parse_wildcard(pattern: &str) -> Vec<Self> {
    use ContentFormat::*;
    const KNOWN: [ContentFormat; 9] =
      [Text, Gif, Jpeg, Png, LinkFormat, Xml, OctetStream, Exi, Json];

    match pattern.strip_suffix("/*") {
      | Some(prefix) => KNOWN.iter()
                             .copied()
                             .filter(|f| {
                               f.name()
                                .split('/')
                                .next()
                                .map(|p| p == prefix)
                                .unwrap_or(false)
                             })
                             .collect(),
      | None => Self::parse(pattern).into_iter().collect(),
    }
  }
}

impl<'a> From<&'a ContentFormat> for u16 {
  fn from(f: &'a ContentFormat) -> Self {
    use ContentFormat::*;
    match *f {
      | Text => 0,
      | Gif => 21,
      | Jpeg => 22,
      | Png => 23,
      | LinkFormat => 40,
      | Xml => 41,
      | OctetStream => 42,
      | Exi => 47,
      | Json => 50,
      | Other(n) => n,
    }
  }
}

impl From<u16> for ContentFormat {
  fn from(n: u16) -> Self {
    use ContentFormat::*;
    match n {
      | 0 => Text,
      | 21 => Gif,
      | 22 => Jpeg,
      | 23 => Png,
      | 40 => LinkFormat,
      | 41 => Xml,
      | 42 => OctetStream,
      | 47 => Exi,
      | 50 => Json,
      | n => Other(n),
    }
  }
}

impl<'a> IntoIterator for &'a ContentFormat {
  type Item = u8;

  type IntoIter = <[u8; 2] as IntoIterator>::IntoIter;

  fn into_iter(self) -> Self::IntoIter {
    self.bytes().into_iter()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn roundtrip() {
    for n in [0u16, 21, 22, 23, 40, 41, 42, 47, 50, 60_000] {
      assert_eq!(u16::from(&ContentFormat::from(n)), n);
    }
  }

  #[test]
  fn unknown() {
    let f = ContentFormat::Other(1234);
    assert_eq!(f.name(), "unknown/1234");
    assert_eq!(f.file_extension(), None);
    assert!(!f.is_printable());
    assert!(!f.is_image());
  }

  #[test]
  fn wildcard() {
    assert_eq!(ContentFormat::parse_wildcard("application/*"),
               vec![ContentFormat::LinkFormat,
                    ContentFormat::Xml,
                    ContentFormat::OctetStream,
                    ContentFormat::Exi,
                    ContentFormat::Json]);
    assert_eq!(ContentFormat::parse_wildcard("application/json"),
               vec![ContentFormat::Json]);
  }
}
