//! Package document parsing (container.xml, OPF, NCX and the EPUB 3 nav
//! document). Every href produced here is relative to the archive root.

use std::borrow::Cow;

use anyhow::{anyhow, Context, Result};
use percent_encoding::percent_decode_str;
use epubridge_core::Link;
use quick_xml::events::{BytesStart, BytesText, Event};
use quick_xml::Reader;
use serde::Serialize;

pub const NCX_MEDIA_TYPE: &str = "application/x-dtbncx+xml";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metadata {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Vec<String>,
}

impl ManifestItem {
    pub fn has_property(&self, property: &str) -> bool {
        self.properties.iter().any(|p| p == property)
    }

    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub metadata: Metadata,
    pub manifest: Vec<ManifestItem>,
    /// Manifest ids in reading order.
    pub spine: Vec<String>,
    pub ncx_id: Option<String>,
    /// Manifest id named by an EPUB 2 `<meta name="cover">`.
    pub cover_meta: Option<String>,
}

impl Package {
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    pub fn reading_order(&self) -> impl Iterator<Item = &ManifestItem> {
        self.spine.iter().filter_map(|id| self.item(id))
    }

    /// The declared cover image: the EPUB 3 `cover-image` item, then the
    /// EPUB 2 cover meta, then any image whose id mentions "cover".
    pub fn cover_item(&self) -> Option<&ManifestItem> {
        self.manifest
            .iter()
            .find(|item| item.has_property("cover-image"))
            .or_else(|| {
                self.cover_meta
                    .as_deref()
                    .and_then(|id| self.item(id))
                    .filter(|item| item.is_image())
            })
            .or_else(|| {
                self.manifest
                    .iter()
                    .find(|item| item.is_image() && item.id.to_ascii_lowercase().contains("cover"))
            })
    }

    pub fn nav_item(&self) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.has_property("nav"))
    }

    pub fn ncx_item(&self) -> Option<&ManifestItem> {
        self.ncx_id
            .as_deref()
            .and_then(|id| self.item(id))
            .or_else(|| self.manifest.iter().find(|item| item.media_type == NCX_MEDIA_TYPE))
    }
}

/// Finds the package document path in META-INF/container.xml.
pub fn parse_container(bytes: &[u8]) -> Result<String> {
    let content = std::str::from_utf8(strip_bom(bytes)).context("container.xml is not UTF-8")?;
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    loop {
        match reader.read_event()? {
            Event::Start(e) | Event::Empty(e) if local_name(e.name().as_ref()) == b"rootfile" => {
                if let Some(path) = attribute(&e, b"full-path") {
                    return Ok(path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Err(anyhow!("container.xml declares no rootfile"))
}

pub fn parse_opf(content: &str, opf_path: &str) -> Result<Package> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut package = Package::default();
    let mut in_metadata = false;
    let mut field: Option<Vec<u8>> = None;
    let mut text = String::new();

    loop {
        let (element, empty) = match reader.read_event()? {
            Event::Start(e) => (e, false),
            Event::Empty(e) => (e, true),
            Event::Text(e) => {
                if field.is_some() {
                    text.push_str(&text_of(&e));
                }
                continue;
            }
            Event::End(e) => {
                let name = e.name();
                let local = local_name(name.as_ref());
                if local == b"metadata" {
                    in_metadata = false;
                }
                if field.as_deref() == Some(local) {
                    let value = std::mem::take(&mut text).trim().to_string();
                    let metadata = &mut package.metadata;
                    match local {
                        b"title" if metadata.title.is_none() => metadata.title = Some(value),
                        b"creator" => metadata.authors.push(value),
                        b"language" if metadata.language.is_none() => metadata.language = Some(value),
                        b"identifier" if metadata.identifier.is_none() => {
                            metadata.identifier = Some(value)
                        }
                        _ => {}
                    }
                    field = None;
                }
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };

        let name = element.name();
        match local_name(name.as_ref()) {
            b"metadata" if !empty => in_metadata = true,
            local @ (b"title" | b"creator" | b"language" | b"identifier") if in_metadata && !empty => {
                field = Some(local.to_vec());
                text.clear();
            }
            b"meta" if attribute(&element, b"name").as_deref() == Some("cover") => {
                package.cover_meta = attribute(&element, b"content");
            }
            b"item" => {
                let (Some(id), Some(href)) = (attribute(&element, b"id"), attribute(&element, b"href"))
                else {
                    continue;
                };
                package.manifest.push(ManifestItem {
                    id,
                    href: resolve_href(opf_path, &href),
                    media_type: attribute(&element, b"media-type").unwrap_or_default(),
                    properties: attribute(&element, b"properties")
                        .map(|p| p.split_ascii_whitespace().map(str::to_string).collect())
                        .unwrap_or_default(),
                });
            }
            b"itemref" => {
                if let Some(idref) = attribute(&element, b"idref") {
                    package.spine.push(idref);
                }
            }
            b"spine" => package.ncx_id = attribute(&element, b"toc"),
            _ => {}
        }
    }

    Ok(package)
}

#[derive(Default)]
struct PendingEntry {
    href: Option<String>,
    title: String,
    children: Vec<Link>,
}

impl PendingEntry {
    /// Entries without a target hand their children to the parent.
    fn finish(self, parent: &mut Vec<Link>) {
        match self.href {
            Some(href) => {
                let title = self.title.trim();
                parent.push(Link {
                    href,
                    media_type: None,
                    title: (!title.is_empty()).then(|| title.to_string()),
                    children: self.children,
                });
            }
            None => parent.extend(self.children),
        }
    }
}

pub fn parse_ncx(content: &str, ncx_path: &str) -> Result<Vec<Link>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack = vec![PendingEntry::default()];
    let mut in_label = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"navPoint" => stack.push(PendingEntry::default()),
                b"text" => in_label = stack.len() > 1,
                _ => {}
            },
            Event::Empty(e) if local_name(e.name().as_ref()) == b"content" => {
                if let (Some(entry), Some(src)) = (stack.last_mut(), attribute(&e, b"src")) {
                    entry.href = Some(resolve_href(ncx_path, &src));
                }
            }
            Event::Text(e) if in_label => {
                if let Some(entry) = stack.last_mut() {
                    entry.title.push_str(&text_of(&e));
                }
            }
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"text" => in_label = false,
                b"navPoint" if stack.len() > 1 => {
                    if let Some(entry) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            entry.finish(&mut parent.children);
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(stack.swap_remove(0).children)
}

/// Reads the `<nav epub:type="toc">` list of an EPUB 3 navigation document.
pub fn parse_nav(content: &str, nav_path: &str) -> Result<Vec<Link>> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut stack = vec![PendingEntry::default()];
    let mut in_toc = false;
    let mut in_label = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"nav" if is_toc_nav(&e) => in_toc = true,
                b"li" if in_toc => stack.push(PendingEntry::default()),
                b"a" if in_toc => {
                    if let Some(entry) = stack.last_mut() {
                        entry.href = attribute(&e, b"href").map(|href| resolve_href(nav_path, &href));
                    }
                    in_label = true;
                }
                b"span" if in_toc => in_label = true,
                _ => {}
            },
            Event::Text(e) if in_label => {
                if let Some(entry) = stack.last_mut() {
                    entry.title.push_str(&text_of(&e));
                }
            }
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"a" | b"span" => in_label = false,
                b"li" if in_toc && stack.len() > 1 => {
                    if let Some(entry) = stack.pop() {
                        if let Some(parent) = stack.last_mut() {
                            entry.finish(&mut parent.children);
                        }
                    }
                }
                b"nav" if in_toc => break,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(stack.swap_remove(0).children)
}

fn is_toc_nav(element: &BytesStart<'_>) -> bool {
    element.attributes().flatten().any(|attr| {
        attr.key.as_ref() == b"epub:type"
            && attr
                .unescape_value()
                .is_ok_and(|value| value.split_ascii_whitespace().any(|t| t == "toc"))
    })
}

/// Resolves `href` against the directory of `base_file`, keeping any
/// fragment. The path is percent-decoded so the result names an archive
/// entry.
pub fn resolve_href(base_file: &str, href: &str) -> String {
    let (path, fragment) = match href.split_once('#') {
        Some((path, fragment)) => (path, Some(fragment)),
        None => (href, None),
    };
    let path = percent_decode_str(path)
        .decode_utf8()
        .unwrap_or(Cow::Borrowed(path));
    let path = path.as_ref();

    let mut segments: Vec<&str> = Vec::new();
    if !path.starts_with('/') {
        if let Some((dir, _)) = base_file.rsplit_once('/') {
            segments.extend(dir.split('/').filter(|s| !s.is_empty()));
        }
    }
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    let mut resolved = segments.join("/");
    if path.is_empty() {
        resolved = base_file.to_string();
    }
    if let Some(fragment) = fragment {
        resolved.push('#');
        resolved.push_str(fragment);
    }
    resolved
}

fn strip_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

fn attribute(element: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == key)
        .and_then(|attr| attr.unescape_value().ok().map(Cow::into_owned))
}

/// XHTML entities such as `&nbsp;` are unknown to the XML unescaper; keep
/// the raw text in that case.
fn text_of(text: &BytesText<'_>) -> String {
    match text.unescape() {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(text).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Moby-Dick</dc:title>
    <dc:creator>Herman Melville</dc:creator>
    <dc:language>en</dc:language>
    <meta name="cover" content="legacy-cover"/>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="c1" href="text/chapter1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="text/chapter2.xhtml" media-type="application/xhtml+xml"/>
    <item id="legacy-cover" href="images/old.jpg" media-type="image/jpeg"/>
    <item id="art" href="images/cover.png" media-type="image/png" properties="cover-image"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="c1"/>
    <itemref idref="c2"/>
  </spine>
</package>"#;

    #[test]
    fn container_names_the_package_document() {
        let container = br#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;
        assert_eq!(parse_container(container).unwrap(), "OEBPS/content.opf");
        assert!(parse_container(b"<container/>").is_err());
    }

    #[test]
    fn opf_manifest_and_spine() {
        let package = parse_opf(OPF, "OEBPS/content.opf").unwrap();

        assert_eq!(package.metadata.title.as_deref(), Some("Moby-Dick"));
        assert_eq!(package.metadata.authors, vec!["Herman Melville"]);
        let order: Vec<&str> = package.reading_order().map(|item| item.href.as_str()).collect();
        assert_eq!(order, vec!["OEBPS/text/chapter1.xhtml", "OEBPS/text/chapter2.xhtml"]);
        assert_eq!(package.nav_item().unwrap().href, "OEBPS/nav.xhtml");
        assert_eq!(package.ncx_item().unwrap().href, "OEBPS/toc.ncx");
    }

    #[test]
    fn cover_lookup_prefers_epub3_property() {
        let mut package = parse_opf(OPF, "OEBPS/content.opf").unwrap();
        assert_eq!(package.cover_item().unwrap().href, "OEBPS/images/cover.png");

        package.manifest.retain(|item| item.id != "art");
        assert_eq!(package.cover_item().unwrap().href, "OEBPS/images/old.jpg");

        package.cover_meta = None;
        assert_eq!(package.cover_item().unwrap().id, "legacy-cover");

        package.manifest.retain(|item| item.id != "legacy-cover");
        assert!(package.cover_item().is_none());

        package.manifest.push(ManifestItem {
            id: "Cover-Image".to_string(),
            href: "OEBPS/c.gif".to_string(),
            media_type: "image/gif".to_string(),
            properties: Vec::new(),
        });
        assert_eq!(package.cover_item().unwrap().id, "Cover-Image");
    }

    #[test]
    fn ncx_builds_nested_links() {
        let ncx = r#"<?xml version="1.0"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <navMap>
    <navPoint id="p1" playOrder="1">
      <navLabel><text>Part One</text></navLabel>
      <content src="text/chapter1.xhtml"/>
      <navPoint id="p1-1" playOrder="2">
        <navLabel><text>Loomings &amp; more</text></navLabel>
        <content src="text/chapter1.xhtml#loomings"/>
      </navPoint>
    </navPoint>
    <navPoint id="p2" playOrder="3">
      <navLabel><text>Part Two</text></navLabel>
      <content src="text/chapter2.xhtml"/>
    </navPoint>
  </navMap>
</ncx>"#;

        let toc = parse_ncx(ncx, "OEBPS/toc.ncx").unwrap();
        assert_eq!(toc.len(), 2);
        assert_eq!(toc[0].title.as_deref(), Some("Part One"));
        assert_eq!(toc[0].children[0].href, "OEBPS/text/chapter1.xhtml#loomings");
        assert_eq!(toc[0].children[0].title.as_deref(), Some("Loomings & more"));
        assert_eq!(toc[1].href, "OEBPS/text/chapter2.xhtml");
    }

    #[test]
    fn nav_reads_only_the_toc_list() {
        let nav = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="landmarks"><ol><li><a href="text/chapter2.xhtml">Start</a></li></ol></nav>
  <nav epub:type="toc">
    <ol>
      <li><a href="text/chapter1.xhtml">Chapter 1</a></li>
      <li><span>Appendices</span>
        <ol><li><a href="../extra/a.xhtml">Appendix A</a></li></ol>
      </li>
    </ol>
  </nav>
</body>
</html>"#;

        let toc = parse_nav(nav, "OEBPS/nav.xhtml").unwrap();
        let hrefs: Vec<&str> = toc.iter().map(|link| link.href.as_str()).collect();
        assert_eq!(hrefs, vec!["OEBPS/text/chapter1.xhtml", "extra/a.xhtml"]);
        assert_eq!(toc[1].title.as_deref(), Some("Appendix A"));
    }

    #[test]
    fn hrefs_resolve_against_the_base_directory() {
        assert_eq!(resolve_href("OEBPS/content.opf", "ch1.xhtml"), "OEBPS/ch1.xhtml");
        assert_eq!(resolve_href("OEBPS/text/nav.xhtml", "../img/a.png"), "OEBPS/img/a.png");
        assert_eq!(resolve_href("content.opf", "./ch1.xhtml#p2"), "ch1.xhtml#p2");
        assert_eq!(resolve_href("OEBPS/content.opf", "/root.xhtml"), "root.xhtml");
        assert_eq!(resolve_href("OEBPS/nav.xhtml", "#top"), "OEBPS/nav.xhtml#top");
        assert_eq!(
            resolve_href("OEBPS/content.opf", "images/cover%20art.png"),
            "OEBPS/images/cover art.png"
        );
        assert_eq!(resolve_href("OEBPS/nav.xhtml", "ch%201.xhtml#p%202"), "OEBPS/ch 1.xhtml#p%202");
    }
}
