//! Category targets, listing-page extraction, and sitemap category discovery.
//!
//! Rendering the storefront is someone else's job: this crate consumes
//! already-rendered listing HTML and turns it into `RawObservation`s.

use std::fs;
use std::path::{Path, PathBuf};

use daam_core::RawObservation;
use quick_xml::events::Event;
use quick_xml::Reader;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "daam-extract";

/// One storefront category page to extract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTarget {
    pub category: String,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing categories file {path}: {source}")]
    Categories {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("malformed sitemap xml: {0}")]
    Sitemap(#[from] quick_xml::Error),
}

/// Built-in targets used when no categories file is available.
pub fn fallback_categories() -> Vec<CategoryTarget> {
    vec![
        CategoryTarget {
            category: "Fruits".to_string(),
            url: "https://chaldal.com/fresh-fruit".to_string(),
        },
        CategoryTarget {
            category: "Vegetables".to_string(),
            url: "https://chaldal.com/fresh-vegetable".to_string(),
        },
    ]
}

pub fn load_categories(path: &Path) -> Result<Vec<CategoryTarget>, ExtractError> {
    let text = fs::read_to_string(path).map_err(|source| ExtractError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ExtractError::Categories {
        path: path.to_path_buf(),
        source,
    })
}

/// Load the categories file, falling back to the built-in defaults when it
/// is missing or unreadable. A bad registry degrades the run, never aborts it.
pub fn load_categories_or_fallback(path: &Path) -> Vec<CategoryTarget> {
    match load_categories(path) {
        Ok(targets) if !targets.is_empty() => targets,
        Ok(_) => {
            warn!(path = %path.display(), "categories file is empty, using fallback categories");
            fallback_categories()
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "categories file unavailable, using fallback categories");
            fallback_categories()
        }
    }
}

/// Filesystem-safe slug for a category, used to name rendered page snapshots.
pub fn category_slug(category: &str) -> String {
    category
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Result of extracting one rendered listing page.
#[derive(Debug, Clone, Default)]
pub struct ListingExtraction {
    pub observations: Vec<RawObservation>,
    /// Product tiles dropped because a name or price element was missing.
    pub skipped_rows: usize,
}

/// Pulls product tiles out of a rendered category listing page.
///
/// Price text is handed over untouched; parsing and validation belong to the
/// normalizer.
#[derive(Debug)]
pub struct ListingExtractor {
    product: Selector,
    name: Selector,
    price: Selector,
    unit: Selector,
    image: Selector,
}

fn parse_selector(selector: &'static str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector,
        message: e.to_string(),
    })
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    let text = element.text().collect::<String>();
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

impl ListingExtractor {
    pub fn new() -> Result<Self, ExtractError> {
        Ok(Self {
            product: parse_selector(".product")?,
            name: parse_selector(".name")?,
            price: parse_selector(".price")?,
            unit: parse_selector(".subText")?,
            image: parse_selector("img")?,
        })
    }

    pub fn extract(&self, html: &str, category: &str) -> ListingExtraction {
        let document = Html::parse_document(html);
        let mut extraction = ListingExtraction::default();

        for product in document.select(&self.product) {
            let class_attr = product.value().attr("class").unwrap_or_default();
            // The cart sidebar reuses the product tile markup.
            if class_attr.contains("total") || class_attr.contains("shoppingCart") {
                continue;
            }

            let name = product.select(&self.name).next().and_then(element_text);
            let price_text = product.select(&self.price).next().and_then(element_text);
            let (Some(name), Some(price_text)) = (name, price_text) else {
                extraction.skipped_rows += 1;
                continue;
            };

            let unit = product.select(&self.unit).next().and_then(element_text);
            let image_url = product
                .select(&self.image)
                .next()
                .and_then(|img| img.value().attr("src"))
                .map(|src| src.trim().to_string())
                .filter(|src| !src.is_empty());

            extraction.observations.push(RawObservation {
                name,
                price_text,
                unit,
                category: category.to_string(),
                image_url,
            });
        }

        extraction
    }
}

/// Read a rendered snapshot for one category from `pages_dir`.
///
/// The browser-automation collaborator drops one `<slug>.html` per category.
pub fn read_rendered_page(pages_dir: &Path, target: &CategoryTarget) -> Result<String, ExtractError> {
    let path = pages_dir.join(format!("{}.html", category_slug(&target.category)));
    fs::read_to_string(&path).map_err(|source| ExtractError::Io { path, source })
}

const SITEMAP_EXCLUDES: [&str; 4] = ["t/", "citySelection", "offers", "help"];

/// Derive category targets from a storefront `sitemap.xml`.
///
/// Keeps `<loc>` URLs on `host` that carry a dashed slug, drops known junk
/// paths, titles the last path segment, and dedups by URL.
pub fn parse_sitemap_categories(xml: &str, host: &str) -> Result<Vec<CategoryTarget>, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut in_loc = false;
    let mut locations = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) if e.local_name().as_ref() == b"loc" => in_loc = true,
            Event::End(e) if e.local_name().as_ref() == b"loc" => in_loc = false,
            Event::Text(text) if in_loc => {
                let url = text.unescape()?.trim().to_string();
                if !url.is_empty() {
                    locations.push(url);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let host_marker = format!("{host}/");
    let mut seen = std::collections::HashSet::new();
    let mut targets = Vec::new();
    for url in locations {
        if !url.contains(&host_marker) || !url.contains('-') {
            continue;
        }
        if SITEMAP_EXCLUDES.iter().any(|junk| url.contains(junk)) {
            continue;
        }
        let Some(slug) = url.rsplit('/').next().filter(|s| !s.is_empty()) else {
            continue;
        };
        if !seen.insert(url.clone()) {
            continue;
        }
        targets.push(CategoryTarget {
            category: title_case(&slug.replace('-', " ")),
            url,
        });
    }
    Ok(targets)
}

fn title_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
