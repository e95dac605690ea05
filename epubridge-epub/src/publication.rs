use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use epubridge_core::{Link, Locator};
use parking_lot::Mutex;
use tracing::{instrument, warn};
use zip::ZipArchive;

use crate::package::{self, ManifestItem, Metadata, Package};

const CONTAINER_PATH: &str = "META-INF/container.xml";

/// An opened EPUB archive.
pub struct Publication {
    package: Package,
    toc: Vec<Link>,
    archive: Mutex<ZipArchive<BufReader<File>>>,
}

impl Publication {
    #[instrument]
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let mut archive = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("{:?} is not a zip archive", path))?;

        let container = read_entry(&mut archive, CONTAINER_PATH)?;
        let opf_path = package::parse_container(&container)?;
        let opf = read_entry(&mut archive, &opf_path)?;
        let opf = String::from_utf8(opf).with_context(|| format!("{opf_path} is not UTF-8"))?;
        let package = package::parse_opf(&opf, &opf_path)
            .with_context(|| format!("failed to parse package document {opf_path}"))?;
        if package.spine.is_empty() {
            return Err(anyhow!("package document {opf_path} has an empty spine"));
        }

        let toc = match load_toc(&mut archive, &package) {
            Ok(toc) => toc,
            Err(err) => {
                warn!(?err, path = %path.display(), "ignoring unreadable table of contents");
                Vec::new()
            }
        };

        Ok(Self {
            package,
            toc,
            archive: Mutex::new(archive),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.package.metadata
    }

    pub fn table_of_contents(&self) -> &[Link] {
        &self.toc
    }

    pub fn reading_order(&self) -> Vec<Link> {
        self.package
            .reading_order()
            .map(|item| Link {
                href: item.href.clone(),
                media_type: Some(item.media_type.clone()),
                title: None,
                children: Vec::new(),
            })
            .collect()
    }

    /// The reading order entry holding `href` (fragment ignored).
    pub fn resource(&self, href: &str) -> Option<&ManifestItem> {
        let path = href.split_once('#').map(|(path, _)| path).unwrap_or(href);
        self.package
            .reading_order()
            .find(|item| item.href == path)
    }

    /// Locator for the start of a reading order resource.
    pub fn locator_for(&self, href: &str) -> Option<Locator> {
        let item = self.resource(href)?;
        let title = self.title_for(&item.href);
        let mut locator = Locator::new(item.href.clone(), item.media_type.clone()).with_progression(0.0);
        locator.title = title;
        Some(locator)
    }

    pub fn start(&self) -> Option<Locator> {
        let first = self.package.reading_order().next()?;
        self.locator_for(&first.href)
    }

    fn title_for(&self, href: &str) -> Option<String> {
        fn find(links: &[Link], href: &str) -> Option<String> {
            links.iter().find_map(|link| {
                let path = link.href.split_once('#').map(|(path, _)| path).unwrap_or(&link.href);
                if path == href && link.title.is_some() {
                    link.title.clone()
                } else {
                    find(&link.children, href)
                }
            })
        }
        find(&self.toc, href)
    }

    pub fn read_resource(&self, href: &str) -> Result<Vec<u8>> {
        read_entry(&mut self.archive.lock(), href)
    }

    pub fn cover_item(&self) -> Option<&ManifestItem> {
        self.package.cover_item()
    }

    /// Raw bytes of the declared cover image, if there is one.
    pub fn cover_bytes(&self) -> Result<Option<Vec<u8>>> {
        match self.cover_item() {
            Some(item) => self.read_resource(&item.href).map(Some),
            None => Ok(None),
        }
    }
}

fn load_toc(archive: &mut ZipArchive<BufReader<File>>, package: &Package) -> Result<Vec<Link>> {
    if let Some(nav) = package.nav_item() {
        let content = read_text(archive, &nav.href)?;
        let toc = package::parse_nav(&content, &nav.href)?;
        if !toc.is_empty() {
            return Ok(toc);
        }
    }
    match package.ncx_item() {
        Some(ncx) => {
            let content = read_text(archive, &ncx.href)?;
            package::parse_ncx(&content, &ncx.href)
        }
        None => Ok(Vec::new()),
    }
}

fn read_entry(archive: &mut ZipArchive<BufReader<File>>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("archive has no entry {name}"))?;
    let mut bytes = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or_default());
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to read {name}"))?;
    Ok(bytes)
}

fn read_text(archive: &mut ZipArchive<BufReader<File>>, name: &str) -> Result<String> {
    let bytes = read_entry(archive, name)?;
    String::from_utf8(bytes).with_context(|| format!("{name} is not UTF-8"))
}
