use super::{Cancellation, Operation, OperationError, OperationResult, require_pdf, run_blocking, single_or_zip};
use crate::services::staging::UploadHandle;
use crate::utils::validation::parse_page_ranges;
use async_trait::async_trait;
use lopdf::{Dictionary, Document, Object, ObjectId};
use std::collections::BTreeMap;

/// Page attributes a page may inherit from its ancestors in the page tree
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Splits a PDF into single-page documents.
///
/// An optional `pages` field (`1-3,5`) selects pages. `split` emits every
/// page by default, `extract` only the first. One resulting page is
/// returned as a PDF, several are zipped.
#[derive(Debug)]
pub struct PdfSplit {
    name: &'static str,
    default_pages: Option<&'static str>,
    archive_name: &'static str,
}

impl PdfSplit {
    pub fn new() -> Self {
        Self {
            name: "split",
            default_pages: None,
            archive_name: "split_pages.zip",
        }
    }

    pub fn extract() -> Self {
        Self {
            name: "extract",
            default_pages: Some("1"),
            archive_name: "extracted_pages.zip",
        }
    }
}

impl Default for PdfSplit {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Operation for PdfSplit {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, input: &UploadHandle) -> OperationResult {
        require_pdf(input, self.name)?;

        let bytes = input.read_all().await?;
        let selection = input
            .field("pages")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or(self.default_pages)
            .map(str::to_string);
        let archive_name = self.archive_name;

        let artifact = run_blocking(move |cancellation| {
            split(&bytes, selection.as_deref(), archive_name, cancellation)
        })
        .await?;

        tracing::info!(
            upload_id = %input.id(),
            operation = %self.name,
            artifact = %artifact.filename,
            output_size = artifact.size(),
            "PDF split"
        );

        Ok(artifact)
    }
}

fn split(
    bytes: &[u8],
    selection: Option<&str>,
    archive_name: &str,
    cancellation: &Cancellation,
) -> OperationResult {
    let doc = Document::load_mem(bytes).map_err(|e| {
        tracing::warn!("Failed to parse PDF: {}", e);
        OperationError::UnsupportedFormat("Could not read PDF".to_string())
    })?;

    let page_ids = doc.get_pages();
    let page_count = page_ids.len() as u32;

    let selected = match selection {
        Some(pages) => parse_page_ranges(pages, page_count)
            .map_err(|e| OperationError::InvalidInput(e.message))?,
        None => page_ids.keys().copied().collect(),
    };

    if selected.is_empty() {
        return Err(OperationError::InvalidInput("No valid pages".to_string()));
    }

    let mut parts = Vec::with_capacity(selected.len());
    for page in selected {
        cancellation.check()?;

        let page_id = page_ids
            .get(&page)
            .copied()
            .ok_or_else(|| OperationError::InvalidInput("No valid pages".to_string()))?;

        let mut single = extract_page(&doc, page_id).map_err(|e| {
            tracing::warn!("Failed to extract page {}: {}", page, e);
            OperationError::UnsupportedFormat("Could not read PDF".to_string())
        })?;

        let mut out = Vec::new();
        single
            .save_to(&mut out)
            .map_err(|e| OperationError::Internal(format!("Failed to write page {}: {}", page, e)))?;
        parts.push((format!("page_{}.pdf", page), out));
    }

    single_or_zip(parts, mime::APPLICATION_PDF.as_ref(), archive_name)
}

/// Builds a one-page document holding only the objects that page reaches.
fn extract_page(source: &Document, page_id: ObjectId) -> Result<Document, lopdf::Error> {
    let mut page = source.get_dictionary(page_id)?.clone();

    // Inherited attributes are pulled down before the page leaves its tree
    let ancestors = ancestors(source, &page);
    for key in INHERITABLE {
        if page.has(key) {
            continue;
        }
        let inherited = ancestors
            .iter()
            .filter_map(|id| source.get_dictionary(*id).ok())
            .find_map(|node| node.get(key).ok().cloned());
        if let Some(value) = inherited {
            page.set(key.to_vec(), value);
        }
    }
    page.remove(b"Parent");

    let mut target = Document::with_version(source.version.clone());
    let pages_id = target.new_object_id();
    let new_page_id = target.new_object_id();

    // References back into the old tree resolve to the new single node
    let mut ids: BTreeMap<ObjectId, ObjectId> = BTreeMap::new();
    ids.insert(page_id, new_page_id);
    for id in &ancestors {
        ids.insert(*id, pages_id);
    }

    let mut page = copy_dictionary(source, &mut target, &page, &mut ids);
    page.set("Parent", pages_id);
    target.objects.insert(new_page_id, Object::Dictionary(page));

    let mut pages = Dictionary::new();
    pages.set("Type", Object::Name(b"Pages".to_vec()));
    pages.set("Kids", vec![Object::Reference(new_page_id)]);
    pages.set("Count", 1i64);
    target.objects.insert(pages_id, Object::Dictionary(pages));

    let mut catalog = Dictionary::new();
    catalog.set("Type", Object::Name(b"Catalog".to_vec()));
    catalog.set("Pages", pages_id);
    let catalog_id = target.add_object(catalog);
    target.trailer.set("Root", catalog_id);

    Ok(target)
}

/// Page tree nodes above `page`, nearest first
fn ancestors(source: &Document, page: &Dictionary) -> Vec<ObjectId> {
    let mut chain = Vec::new();
    let mut next = page.get(b"Parent").and_then(Object::as_reference).ok();
    while let Some(id) = next {
        if chain.contains(&id) {
            break;
        }
        chain.push(id);
        next = source
            .get_dictionary(id)
            .ok()
            .and_then(|node| node.get(b"Parent").and_then(Object::as_reference).ok());
    }
    chain
}

fn copy_object(
    source: &Document,
    target: &mut Document,
    object: &Object,
    ids: &mut BTreeMap<ObjectId, ObjectId>,
) -> Object {
    match object {
        Object::Reference(id) => Object::Reference(copy_reference(source, target, *id, ids)),
        Object::Array(items) => Object::Array(
            items
                .iter()
                .map(|item| copy_object(source, target, item, ids))
                .collect(),
        ),
        Object::Dictionary(dict) => Object::Dictionary(copy_dictionary(source, target, dict, ids)),
        Object::Stream(stream) => {
            let mut stream = stream.clone();
            stream.dict = copy_dictionary(source, target, &stream.dict, ids);
            Object::Stream(stream)
        }
        other => other.clone(),
    }
}

fn copy_dictionary(
    source: &Document,
    target: &mut Document,
    dict: &Dictionary,
    ids: &mut BTreeMap<ObjectId, ObjectId>,
) -> Dictionary {
    let mut copy = Dictionary::new();
    for (key, value) in dict.iter() {
        copy.set(key.clone(), copy_object(source, target, value, ids));
    }
    copy
}

fn copy_reference(
    source: &Document,
    target: &mut Document,
    id: ObjectId,
    ids: &mut BTreeMap<ObjectId, ObjectId>,
) -> ObjectId {
    if let Some(copied) = ids.get(&id) {
        return *copied;
    }

    // Registered before recursing so reference cycles terminate
    let new_id = target.new_object_id();
    ids.insert(id, new_id);

    let object = match source.get_object(id) {
        Ok(object) => copy_object(source, target, object, ids),
        Err(_) => Object::Null,
    };
    target.objects.insert(new_id, object);
    new_id
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::{Stream, dictionary};
    use std::io::Cursor;

    /// Minimal PDF with `pages` empty pages
    pub(crate) fn sample_pdf(pages: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let mut kids: Vec<Object> = Vec::new();
        for i in 0..pages {
            let content = Stream::new(dictionary! {}, format!("% page {}", i + 1).into_bytes());
            let content_id = doc.add_object(content);
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            });
            kids.push(page_id.into());
        }

        let pages_dict = dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => pages as i64,
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages_dict));

        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    fn page_count(bytes: &[u8]) -> usize {
        Document::load_mem(bytes).unwrap().get_pages().len()
    }

    #[test]
    fn test_single_page_returns_pdf() {
        let artifact = split(&sample_pdf(1), None, "split_pages.zip", &Cancellation::default()).unwrap();
        assert_eq!(artifact.filename, "page_1.pdf");
        assert_eq!(artifact.content_type, "application/pdf");
        assert_eq!(page_count(&artifact.bytes), 1);
    }

    #[test]
    fn test_many_pages_are_zipped() {
        let artifact = split(&sample_pdf(3), None, "split_pages.zip", &Cancellation::default()).unwrap();
        assert_eq!(artifact.filename, "split_pages.zip");
        assert_eq!(artifact.content_type, "application/zip");

        let mut archive = zip::ZipArchive::new(Cursor::new(artifact.bytes.to_vec())).unwrap();
        assert_eq!(archive.len(), 3);
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i).unwrap();
            assert_eq!(entry.name(), format!("page_{}.pdf", i + 1));
            let mut page = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut page).unwrap();
            assert_eq!(page_count(&page), 1);
        }
    }

    #[test]
    fn test_page_selection() {
        let artifact = split(&sample_pdf(3), Some("2"), "split_pages.zip", &Cancellation::default()).unwrap();
        assert_eq!(artifact.filename, "page_2.pdf");

        let artifact = split(&sample_pdf(4), Some("2-3"), "split_pages.zip", &Cancellation::default()).unwrap();
        assert_eq!(artifact.filename, "split_pages.zip");
    }

    #[test]
    fn test_no_valid_pages() {
        let err = split(&sample_pdf(2), Some("7"), "split_pages.zip", &Cancellation::default()).unwrap_err();
        assert!(matches!(err, OperationError::InvalidInput(ref m) if m == "No valid pages"));

        let err = split(&sample_pdf(2), Some("x"), "split_pages.zip", &Cancellation::default()).unwrap_err();
        assert!(matches!(err, OperationError::InvalidInput(_)));
    }

    #[test]
    fn test_split_pages_keep_inherited_attributes() {
        // MediaBox and Resources live on the Pages node, not the page
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let mut kids: Vec<Object> = Vec::new();
        for _ in 0..2 {
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
            });
            kids.push(page_id.into());
        }
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => 2i64,
                "MediaBox" => vec![0.into(), 0.into(), 300.into(), 400.into()],
                "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap();

        let artifact = split(&bytes, Some("2"), "split_pages.zip", &Cancellation::default()).unwrap();
        let single = Document::load_mem(&artifact.bytes).unwrap();
        let pages = single.get_pages();
        assert_eq!(pages.len(), 1);

        let page = single.get_dictionary(pages[&1]).unwrap();
        let media_box = page.get(b"MediaBox").unwrap().as_array().unwrap();
        assert_eq!(media_box[2].as_i64().unwrap(), 300);

        let resources = page.get(b"Resources").unwrap().as_dict().unwrap();
        let font_ref = resources
            .get(b"Font")
            .unwrap()
            .as_dict()
            .unwrap()
            .get(b"F1")
            .unwrap()
            .as_reference()
            .unwrap();
        let font = single.get_dictionary(font_ref).unwrap();
        assert_eq!(font.get(b"BaseFont").unwrap().as_name().unwrap(), b"Helvetica");
    }

    #[test]
    fn test_page_output_does_not_carry_other_pages() {
        let source = sample_pdf(5);
        let artifact = split(&source, Some("3"), "split_pages.zip", &Cancellation::default()).unwrap();
        let single = Document::load_mem(&artifact.bytes).unwrap();

        // catalog, pages, page, content stream
        assert_eq!(single.objects.len(), 4);
        let content = single.get_page_content(single.get_pages()[&1]).unwrap();
        assert_eq!(content, b"% page 3");
    }

    #[test]
    fn test_cancelled_split_stops_before_work() {
        let cancellation = Cancellation::default();
        cancellation.cancel();
        let err = split(&sample_pdf(3), None, "split_pages.zip", &cancellation).unwrap_err();
        assert!(matches!(err, OperationError::Internal(ref m) if m.contains("cancelled")));
    }

    #[test]
    fn test_extract_defaults_to_first_page() {
        let op = PdfSplit::extract();
        assert_eq!(op.name(), "extract");
        assert_eq!(op.default_pages, Some("1"));

        let artifact = split(&sample_pdf(3), Some("1-2"), op.archive_name, &Cancellation::default()).unwrap();
        assert_eq!(artifact.filename, "extracted_pages.zip");
    }

    #[test]
    fn test_garbage_is_unsupported() {
        let err = split(b"%PDF-1.4 but not really", None, "split_pages.zip", &Cancellation::default()).unwrap_err();
        assert!(matches!(err, OperationError::UnsupportedFormat(_)));
    }
}
