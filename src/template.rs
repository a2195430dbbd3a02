use std::collections::BTreeMap;

use image::RgbImage;
use imageproc::point::Point;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

use crate::GrayF32Image;
use crate::error::{Error, Result};

/// Camera-relative pose from the training renderer. Opaque to the pipeline;
/// collaborators read it back off matched templates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Row-major 3x3 rotation.
    pub rotation: [f32; 9],
    pub translation: [f32; 3],
}

impl Default for Pose {
    fn default() -> Self {
        Pose {
            rotation: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            translation: [0.0; 3],
        }
    }
}

/// Feature arrays extracted at training time, parallel to the selected
/// edge/stable points of one template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateFeatures {
    /// Gradient orientation bin per edge point.
    pub gradient_orientations: Vec<u8>,
    /// Surface normal bin per stable point.
    pub surface_normals: Vec<u8>,
    /// Raw depth per stable point.
    pub depths: Vec<f32>,
    /// HSV color per stable point (hue in half-degrees).
    pub colors: Vec<[u8; 3]>,
    /// Median of `depths`, truncated.
    pub depth_median: i32,
}

/// One training exemplar: aligned source planes, the object bounding box,
/// pose and physical diameter, plus the feature points and feature arrays
/// filled in during training. Read-only once training completes.
#[derive(Debug, Clone)]
pub struct Template {
    pub id: u32,
    pub object_id: u32,
    pub src_rgb: RgbImage,
    /// Grayscale source, normalized to `[0, 1]`.
    pub src_gray: GrayF32Image,
    /// HSV rendition of the color source (hue in half-degrees).
    pub src_hsv: RgbImage,
    /// Depth source in scene units; zero marks holes.
    pub src_depth: GrayF32Image,
    /// Object bounding box within the sources.
    pub object_bb: Rect,
    pub pose: Pose,
    /// Physical object diameter in depth units.
    pub diameter: f32,
    /// Selected edge points, bounding-box coordinates.
    pub edge_points: Vec<Point<i32>>,
    /// Selected stable points, bounding-box coordinates. Every stable point
    /// sits on nonzero source depth.
    pub stable_points: Vec<Point<i32>>,
    pub features: TemplateFeatures,
}

impl Template {
    /// Parse-time constructor: sources, box, pose and diameter. Feature
    /// points and feature arrays stay empty until training.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        object_id: u32,
        src_rgb: RgbImage,
        src_gray: GrayF32Image,
        src_hsv: RgbImage,
        src_depth: GrayF32Image,
        object_bb: Rect,
        pose: Pose,
        diameter: f32,
    ) -> Template {
        Template {
            id,
            object_id,
            src_rgb,
            src_gray,
            src_hsv,
            src_depth,
            object_bb,
            pose,
            diameter,
            edge_points: Vec::new(),
            stable_points: Vec::new(),
            features: TemplateFeatures::default(),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let dims = self.src_gray.dimensions();
        if dims != self.src_rgb.dimensions()
            || dims != self.src_hsv.dimensions()
            || dims != self.src_depth.dimensions()
        {
            return Err(Error::InvalidInput(format!(
                "template {}: source planes disagree on resolution",
                self.id
            )));
        }
        let (w, h) = dims;
        if w < 3 || h < 3 {
            return Err(Error::InvalidInput(format!(
                "template {}: {w}x{h} source is too small",
                self.id
            )));
        }
        let bb = self.object_bb;
        if bb.left() < 0
            || bb.top() < 0
            || bb.left() as i64 + bb.width() as i64 > w as i64
            || bb.top() as i64 + bb.height() as i64 > h as i64
        {
            return Err(Error::InvalidInput(format!(
                "template {}: bounding box lies outside the {w}x{h} source",
                self.id
            )));
        }
        if self.diameter <= 0.0 {
            return Err(Error::InvalidInput(format!(
                "template {}: diameter must be positive",
                self.id
            )));
        }
        Ok(())
    }
}

/// Templates sharing an object id. Holds member ids only; the store owns
/// the records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateGroup {
    pub object_id: u32,
    pub member_ids: Vec<u32>,
}

/// Flat, id-ordered template collection with id-only groups. Built once at
/// the end of feature selection and read-only afterwards; hash tables refer
/// into it by template id.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    templates: Vec<Template>,
    groups: Vec<TemplateGroup>,
}

impl TemplateStore {
    pub(crate) fn new(mut templates: Vec<Template>) -> Result<Self> {
        templates.sort_by_key(|t| t.id);
        for pair in templates.windows(2) {
            if pair[0].id == pair[1].id {
                return Err(Error::InvalidInput(format!(
                    "duplicate template id {}",
                    pair[0].id
                )));
            }
        }

        let mut by_object: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for t in &templates {
            by_object.entry(t.object_id).or_default().push(t.id);
        }
        let groups = by_object
            .into_iter()
            .map(|(object_id, member_ids)| TemplateGroup { object_id, member_ids })
            .collect();

        Ok(TemplateStore { templates, groups })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn groups(&self) -> &[TemplateGroup] {
        &self.groups
    }

    pub fn get(&self, id: u32) -> Option<&Template> {
        self.templates
            .binary_search_by_key(&id, |t| t.id)
            .ok()
            .map(|i| &self.templates[i])
    }

    /// All template ids in ascending order.
    pub fn ids(&self) -> Vec<u32> {
        self.templates.iter().map(|t| t.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::ImageBuffer;

    fn blank_template(id: u32, object_id: u32) -> Template {
        let rgb = RgbImage::new(8, 8);
        let gray: GrayF32Image = ImageBuffer::new(8, 8);
        let depth: GrayF32Image = ImageBuffer::new(8, 8);
        Template::new(
            id,
            object_id,
            rgb.clone(),
            gray,
            rgb,
            depth,
            Rect::at(1, 1).of_size(5, 5),
            Pose::default(),
            1.0,
        )
    }

    #[test]
    fn test_store_orders_by_id_and_groups_by_object() {
        let store = TemplateStore::new(vec![
            blank_template(2, 7),
            blank_template(0, 7),
            blank_template(1, 3),
        ])
        .unwrap();

        assert_eq!(store.ids(), vec![0, 1, 2]);
        assert_eq!(
            store.groups(),
            &[
                TemplateGroup { object_id: 3, member_ids: vec![1] },
                TemplateGroup { object_id: 7, member_ids: vec![0, 2] },
            ]
        );
        assert_eq!(store.get(2).unwrap().object_id, 7);
        assert!(store.get(9).is_none());
    }

    #[test]
    fn test_store_rejects_duplicate_ids() {
        let result = TemplateStore::new(vec![blank_template(1, 0), blank_template(1, 0)]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_out_of_range_bounding_box() {
        let mut t = blank_template(0, 0);
        t.object_bb = Rect::at(4, 4).of_size(8, 8);
        assert!(matches!(t.validate(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_validate_rejects_mismatched_planes() {
        let mut t = blank_template(0, 0);
        t.src_depth = ImageBuffer::new(9, 8);
        assert!(matches!(t.validate(), Err(Error::InvalidInput(_))));
    }
}
