//! Leaf filter: classify candidate images by their source annotations.

use crate::config::ResolvedFilter;
use crate::models::{Annotation, ImageRecord};
use crate::platform::PlatformApi;
use crate::Result;
use std::collections::HashMap;
use tracing::debug;

/// Which output list an image belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageClass {
    Annotated,
    Tagged,
}

/// Classify one annotation. Annotated wins when both filters match.
pub fn classify(annotation: &Annotation, filter: &ResolvedFilter) -> Option<ImageClass> {
    if let Some(types) = &filter.annotation_types {
        if annotation.has_geometry_in(types) {
            return Some(ImageClass::Annotated);
        }
    }
    if let Some(tag_name) = &filter.tag_name {
        if annotation.has_tag(tag_name) {
            return Some(ImageClass::Tagged);
        }
    }
    None
}

/// Images selected from one dataset, in candidate order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilteredImages {
    pub annotated: Vec<ImageRecord>,
    pub tagged: Vec<ImageRecord>,
}

/// Split `candidates` into annotated and tagged images.
///
/// Annotations are fetched from the source in batches of `batch_size`.
/// With both filters disabled every candidate is returned as annotated and
/// no annotation is fetched.
pub async fn filter_images(
    source: &dyn PlatformApi,
    dataset_id: i64,
    candidates: &[ImageRecord],
    filter: &ResolvedFilter,
    batch_size: usize,
) -> Result<FilteredImages> {
    if filter.is_pass_through() {
        return Ok(FilteredImages {
            annotated: candidates.to_vec(),
            tagged: Vec::new(),
        });
    }

    let mut annotations: HashMap<i64, Annotation> = HashMap::with_capacity(candidates.len());
    for batch in candidates.chunks(batch_size.max(1)) {
        let ids: Vec<i64> = batch.iter().map(|image| image.id).collect();
        debug!(
            "Downloading {} annotations from dataset {}",
            ids.len(),
            dataset_id
        );
        for record in source.download_annotations(dataset_id, &ids).await? {
            annotations.insert(record.image_id, record.annotation);
        }
    }

    let mut result = FilteredImages::default();
    for image in candidates {
        let class = annotations
            .get(&image.id)
            .and_then(|annotation| classify(annotation, filter));
        match class {
            Some(ImageClass::Annotated) => result.annotated.push(image.clone()),
            Some(ImageClass::Tagged) => result.tagged.push(image.clone()),
            None => {}
        }
    }

    Ok(result)
}
