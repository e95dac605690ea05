//! Small EPUB archives written on the fly for tests.

use std::fmt::Write as _;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use zip::write::FileOptions;
use zip::ZipWriter;

const CONTAINER: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

struct Chapter {
    href: String,
    entry: String,
    title: String,
}

struct Cover {
    href: String,
    entry: String,
    bytes: Vec<u8>,
}

/// An EPUB 3 package under `OEBPS/` with a nav document. Hrefs are written
/// into the OPF and nav as given; entries name the files in the archive.
pub struct EpubFixture {
    chapters: Vec<Chapter>,
    cover: Option<Cover>,
}

impl Default for EpubFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl EpubFixture {
    /// Two chapters, "Chapter One" and "Chapter Two", and no cover.
    pub fn new() -> Self {
        Self {
            chapters: Vec::new(),
            cover: None,
        }
        .chapters(&[
            ("chapter1.xhtml", "chapter1.xhtml", "Chapter One"),
            ("chapter2.xhtml", "chapter2.xhtml", "Chapter Two"),
        ])
    }

    /// Replaces the chapters with `(href, entry, title)` triples.
    pub fn chapters(mut self, chapters: &[(&str, &str, &str)]) -> Self {
        self.chapters = chapters
            .iter()
            .map(|(href, entry, title)| Chapter {
                href: href.to_string(),
                entry: entry.to_string(),
                title: title.to_string(),
            })
            .collect();
        self
    }

    pub fn cover(self, bytes: &[u8]) -> Self {
        self.cover_at("images/cover.png", "images/cover.png", bytes)
    }

    pub fn cover_at(mut self, href: &str, entry: &str, bytes: &[u8]) -> Self {
        self.cover = Some(Cover {
            href: href.to_string(),
            entry: entry.to_string(),
            bytes: bytes.to_vec(),
        });
        self
    }

    fn opf(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();
        for (index, chapter) in self.chapters.iter().enumerate() {
            let _ = writeln!(
                manifest,
                r#"    <item id="c{index}" href="{}" media-type="application/xhtml+xml"/>"#,
                chapter.href
            );
            let _ = writeln!(spine, r#"    <itemref idref="c{index}"/>"#);
        }
        if let Some(cover) = &self.cover {
            let _ = writeln!(
                manifest,
                r#"    <item id="cover" href="{}" media-type="image/png" properties="cover-image"/>"#,
                cover.href
            );
        }
        format!(
            r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Fixture</dc:title>
    <dc:creator>Tester</dc:creator>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
{manifest}  </manifest>
  <spine>
{spine}  </spine>
</package>"#
        )
    }

    fn nav(&self) -> String {
        let entries: String = self
            .chapters
            .iter()
            .map(|chapter| format!(r#"      <li><a href="{}">{}</a></li>"#, chapter.href, chapter.title) + "\n")
            .collect();
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
<body>
  <nav epub:type="toc">
    <ol>
{entries}    </ol>
  </nav>
</body>
</html>"#
        )
    }

    pub fn write(&self, dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = FileOptions::default();

        let mut add = |name: &str, bytes: &[u8]| {
            zip.start_file(name, options).unwrap();
            zip.write_all(bytes).unwrap();
        };
        add("mimetype", b"application/epub+zip");
        add("META-INF/container.xml", CONTAINER.as_bytes());
        add("OEBPS/content.opf", self.opf().as_bytes());
        add("OEBPS/nav.xhtml", self.nav().as_bytes());
        for chapter in &self.chapters {
            let body = format!("<html><body><p>{}</p></body></html>", chapter.title);
            add(&format!("OEBPS/{}", chapter.entry), body.as_bytes());
        }
        if let Some(cover) = &self.cover {
            add(&format!("OEBPS/{}", cover.entry), &cover.bytes);
        }
        zip.finish().unwrap();
        path
    }
}

/// Writes the default fixture into `dir`, with `cover` stored as the cover
/// image when given.
pub fn write_epub(dir: &Path, name: &str, cover: Option<&[u8]>) -> PathBuf {
    let fixture = EpubFixture::new();
    let fixture = match cover {
        Some(bytes) => fixture.cover(bytes),
        None => fixture,
    };
    fixture.write(dir, name)
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = image::RgbaImage::from_pixel(width, height, image::Rgba([200, 30, 30, 255]));
    let mut bytes = Vec::new();
    image::DynamicImage::ImageRgba8(image)
        .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .unwrap();
    bytes
}
