// Copyright (c) 2025 Steven Rosenthal smr@dt3.org
// See LICENSE file in root directory for license terms.

//! Viola-Jones object detection with boosted Haar cascades, reading the
//! cascade models distributed with OpenCV (e.g.
//! `haarcascade_frontalface_default.xml`, `haarcascade_smile.xml`).
//!
//! Only the current OpenCV cascade XML layout is understood: a `<cascade>`
//! element with `stageType` BOOST and `featureType` HAAR. Tilted (45 degree)
//! features are not supported.

use std::borrow::Cow;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use canonical_error::{CanonicalError, invalid_argument_error, not_found_error};
use image::GrayImage;
use image::imageops::{self, FilterType};
use log::debug;
use roxmltree::{Document, Node};

use smile_elements::detector_trait::{DetectParams, DetectorTrait, FaceBox};

// Stage sums are compared against the stage threshold with this slack, as
// cascades are trained with it.
const THRESHOLD_EPS: f32 = 1e-5;

// Relative tolerance used to cluster raw detections.
const GROUP_EPS: f64 = 0.2;

#[derive(Debug)]
struct HaarRect {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    weight: f32,
}

#[derive(Debug)]
struct HaarFeature {
    rects: Vec<HaarRect>,
}

#[derive(Debug)]
struct TreeNode {
    // Positive: index of the next node. Zero or negative: -index into the
    // weak classifier's leaf values.
    left: i32,
    right: i32,
    feature: usize,
    threshold: f32,
}

#[derive(Debug)]
struct WeakClassifier {
    nodes: Vec<TreeNode>,
    leaves: Vec<f32>,
}

#[derive(Debug)]
struct Stage {
    threshold: f32,
    classifiers: Vec<WeakClassifier>,
}

pub struct HaarCascade {
    // Base detection window (width, height).
    window: (u32, u32),
    stages: Vec<Stage>,
    features: Vec<HaarFeature>,
}

impl HaarCascade {
    pub fn from_file(path: &Path) -> Result<Self, CanonicalError> {
        let text = fs::read_to_string(path).map_err(|e| {
            not_found_error(&format!("Cannot read cascade {:?}: {}", path, e))
        })?;
        let cascade = Self::from_xml(&text).map_err(|e| {
            invalid_argument_error(&format!("Cascade {:?}: {}", path, e.message))
        })?;
        debug!("Loaded cascade {:?}: {} stages, {} features, window {:?}",
               path, cascade.stages.len(), cascade.features.len(), cascade.window);
        Ok(cascade)
    }

    pub fn from_xml(text: &str) -> Result<Self, CanonicalError> {
        let doc = Document::parse(text).map_err(|e| {
            invalid_argument_error(&format!("Malformed cascade XML: {}", e))
        })?;
        let cascade = child(doc.root_element(), "cascade")?;

        let stage_type = node_text(child(cascade, "stageType")?);
        if stage_type != "BOOST" {
            return Err(invalid_argument_error(
                &format!("Unsupported stageType {}", stage_type)));
        }
        let feature_type = node_text(child(cascade, "featureType")?);
        if feature_type != "HAAR" {
            return Err(invalid_argument_error(
                &format!("Unsupported featureType {}", feature_type)));
        }
        let width: u32 = parse_one(child(cascade, "width")?)?;
        let height: u32 = parse_one(child(cascade, "height")?)?;
        if width < 3 || height < 3 {
            return Err(invalid_argument_error(
                &format!("Window {}x{} too small", width, height)));
        }

        let mut features = Vec::<HaarFeature>::new();
        for feature_node in items(child(cascade, "features")?) {
            features.push(parse_feature(feature_node, width, height)?);
        }

        let mut stages = Vec::<Stage>::new();
        for stage_node in items(child(cascade, "stages")?) {
            let threshold: f32 = parse_one(child(stage_node, "stageThreshold")?)?;
            let mut classifiers = Vec::<WeakClassifier>::new();
            for weak_node in items(child(stage_node, "weakClassifiers")?) {
                classifiers.push(parse_weak_classifier(weak_node, features.len())?);
            }
            stages.push(Stage{threshold, classifiers});
        }
        if stages.is_empty() {
            return Err(invalid_argument_error("Cascade has no stages"));
        }
        Ok(HaarCascade{window: (width, height), stages, features})
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    // Runs the window over an image pyramid and returns every window that
    // passes all stages, in `image` coordinates. No grouping.
    fn detect_raw(&self, image: &GrayImage, params: &DetectParams) -> Vec<FaceBox> {
        let mut windows = Vec::<FaceBox>::new();
        if params.scale_factor <= 1.0 {
            debug!("Ignoring detection with scale_factor {}", params.scale_factor);
            return windows;
        }
        let (img_w, img_h) = image.dimensions();
        let (win_w, win_h) = self.window;
        let max_size = if params.max_size.0 == 0 || params.max_size.1 == 0 {
            (img_w, img_h)
        } else {
            params.max_size
        };

        let mut factor = 1.0_f64;
        loop {
            let window_w = (win_w as f64 * factor).round() as u32;
            let window_h = (win_h as f64 * factor).round() as u32;
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }
            if window_w > max_size.0 || window_h > max_size.1 {
                break;
            }
            if window_w < params.min_size.0 || window_h < params.min_size.1 {
                factor *= params.scale_factor;
                continue;
            }
            let scaled: Cow<GrayImage> = if scaled_w == img_w && scaled_h == img_h {
                Cow::Borrowed(image)
            } else {
                Cow::Owned(imageops::resize(image, scaled_w, scaled_h,
                                            FilterType::Triangle))
            };
            let integral = IntegralImage::new(&scaled);
            let step = if factor > 2.0 { 1 } else { 2 };
            for y in (0..=scaled_h - win_h).step_by(step) {
                for x in (0..=scaled_w - win_w).step_by(step) {
                    if self.evaluate_window(&integral, x, y) {
                        windows.push(FaceBox::new(
                            (x as f64 * factor).round() as i32,
                            (y as f64 * factor).round() as i32,
                            window_w as i32, window_h as i32));
                    }
                }
            }
            factor *= params.scale_factor;
        }
        windows
    }

    // Returns true if the window at `x`, `y` (in the integral image's
    // coordinates) passes every stage.
    fn evaluate_window(&self, integral: &IntegralImage, x: u32, y: u32) -> bool {
        // Features are normalized by the standard deviation of the window,
        // measured one pixel in from its border.
        let (norm_w, norm_h) = (self.window.0 - 2, self.window.1 - 2);
        let area = (norm_w * norm_h) as f64;
        let sum = integral.sum(x + 1, y + 1, norm_w, norm_h) as f64;
        let sq_sum = integral.squared_sum(x + 1, y + 1, norm_w, norm_h) as f64;
        let variance = area * sq_sum - sum * sum;
        let norm_factor = if variance > 0.0 { variance.sqrt() } else { 1.0 };

        for stage in &self.stages {
            let mut stage_sum = 0.0_f32;
            for weak in &stage.classifiers {
                let mut idx = 0_i32;
                loop {
                    let node = &weak.nodes[idx as usize];
                    let value = self.features[node.feature].evaluate(integral, x, y);
                    idx = if value < node.threshold as f64 * norm_factor {
                        node.left
                    } else {
                        node.right
                    };
                    if idx <= 0 {
                        break;
                    }
                }
                stage_sum += weak.leaves[(-idx) as usize];
            }
            if stage_sum < stage.threshold - THRESHOLD_EPS {
                return false;
            }
        }
        true
    }
}

impl DetectorTrait for HaarCascade {
    fn detect_multi_scale(&self, image: &GrayImage, params: &DetectParams)
                          -> Vec<FaceBox> {
        let raw = self.detect_raw(image, params);
        group_rectangles(raw, params.min_neighbors, GROUP_EPS)
    }

    fn window_size(&self) -> (u32, u32) {
        self.window
    }
}

impl HaarFeature {
    fn evaluate(&self, integral: &IntegralImage, x: u32, y: u32) -> f64 {
        let mut value = 0.0_f64;
        for r in &self.rects {
            value += r.weight as f64 *
                integral.sum(x + r.x, y + r.y, r.width, r.height) as f64;
        }
        value
    }
}

// Summed-area tables with a leading row and column of zeros.
struct IntegralImage {
    stride: usize,
    sum: Vec<u32>,
    sq_sum: Vec<u64>,
}

impl IntegralImage {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0_u32; stride * (h + 1)];
        let mut sq_sum = vec![0_u64; stride * (h + 1)];
        let raw = image.as_raw();
        for y in 0..h {
            let mut row_sum = 0_u32;
            let mut row_sq_sum = 0_u64;
            for x in 0..w {
                let v = raw[y * w + x] as u32;
                row_sum += v;
                row_sq_sum += (v * v) as u64;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sq_sum[idx] = sq_sum[idx - stride] + row_sq_sum;
            }
        }
        IntegralImage{stride, sum, sq_sum}
    }

    fn corners(&self, x: u32, y: u32, w: u32, h: u32) -> (usize, usize, usize, usize) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = ((x + w) as usize, (y + h) as usize);
        (y0 * self.stride + x0, y0 * self.stride + x1,
         y1 * self.stride + x0, y1 * self.stride + x1)
    }

    fn sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (tl, tr, bl, br) = self.corners(x, y, w, h);
        self.sum[br] as i64 + self.sum[tl] as i64
            - self.sum[tr] as i64 - self.sum[bl] as i64
    }

    fn squared_sum(&self, x: u32, y: u32, w: u32, h: u32) -> i64 {
        let (tl, tr, bl, br) = self.corners(x, y, w, h);
        self.sq_sum[br] as i64 + self.sq_sum[tl] as i64
            - self.sq_sum[tr] as i64 - self.sq_sum[bl] as i64
    }
}

/// Clusters overlapping detections. Clusters with `group_threshold` or fewer
/// members are discarded; each surviving cluster is reported as the average
/// of its members. Small clusters lying inside a larger, better supported
/// cluster are dropped as well. A `group_threshold` of zero returns `rects`
/// unchanged.
pub fn group_rectangles(rects: Vec<FaceBox>, group_threshold: u32, eps: f64)
                        -> Vec<FaceBox> {
    if group_threshold == 0 || rects.is_empty() {
        return rects;
    }
    let (labels, num_classes) = partition(&rects, eps);

    let mut sums = vec![(0_i64, 0_i64, 0_i64, 0_i64); num_classes];
    let mut counts = vec![0_u32; num_classes];
    for (r, label) in rects.iter().zip(labels.iter()) {
        let s = &mut sums[*label];
        s.0 += r.x as i64;
        s.1 += r.y as i64;
        s.2 += r.width as i64;
        s.3 += r.height as i64;
        counts[*label] += 1;
    }
    let averaged: Vec<FaceBox> = sums.iter().zip(counts.iter()).map(|(s, n)| {
        let n = *n as f64;
        FaceBox::new((s.0 as f64 / n).round() as i32, (s.1 as f64 / n).round() as i32,
                     (s.2 as f64 / n).round() as i32, (s.3 as f64 / n).round() as i32)
    }).collect();

    let mut grouped = Vec::<FaceBox>::new();
    for i in 0..num_classes {
        let n1 = counts[i];
        if n1 <= group_threshold {
            continue;
        }
        let r1 = averaged[i];
        let nested = (0..num_classes).any(|j| {
            let n2 = counts[j];
            if j == i || n2 <= group_threshold {
                return false;
            }
            let r2 = averaged[j];
            let dx = (r2.width as f64 * eps).round() as i32;
            let dy = (r2.height as f64 * eps).round() as i32;
            r1.x >= r2.x - dx && r1.y >= r2.y - dy &&
                r1.x + r1.width <= r2.x + r2.width + dx &&
                r1.y + r1.height <= r2.y + r2.height + dy &&
                (n2 > std::cmp::max(3, n1) || n1 < 3)
        });
        if !nested {
            grouped.push(r1);
        }
    }
    grouped
}

fn similar_rects(a: &FaceBox, b: &FaceBox, eps: f64) -> bool {
    let delta = eps * (std::cmp::min(a.width, b.width) +
                       std::cmp::min(a.height, b.height)) as f64 * 0.5;
    ((a.x - b.x).abs() as f64) <= delta &&
        ((a.y - b.y).abs() as f64) <= delta &&
        ((a.x + a.width - b.x - b.width).abs() as f64) <= delta &&
        ((a.y + a.height - b.y - b.height).abs() as f64) <= delta
}

// Union-find over the similarity relation. Returns each rect's class label
// (numbered by first appearance) and the number of classes.
fn partition(rects: &[FaceBox], eps: f64) -> (Vec<usize>, usize) {
    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            if similar_rects(&rects[i], &rects[j], eps) {
                let root_i = find(&mut parent, i);
                let root_j = find(&mut parent, j);
                if root_i != root_j {
                    parent[root_j] = root_i;
                }
            }
        }
    }

    let mut class_of_root = vec![usize::MAX; n];
    let mut labels = Vec::with_capacity(n);
    let mut num_classes = 0;
    for i in 0..n {
        let root = find(&mut parent, i);
        if class_of_root[root] == usize::MAX {
            class_of_root[root] = num_classes;
            num_classes += 1;
        }
        labels.push(class_of_root[root]);
    }
    (labels, num_classes)
}

// XML helpers.

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str)
                     -> Result<Node<'a, 'input>, CanonicalError> {
    node.children().find(|n| n.has_tag_name(name)).ok_or_else(|| {
        invalid_argument_error(&format!("Missing <{}> under <{}>",
                                        name, node.tag_name().name()))
    })
}

// OpenCV serializes sequences as repeated `<_>` elements.
fn items<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.has_tag_name("_"))
}

fn node_text<'a>(node: Node<'a, '_>) -> &'a str {
    node.text().unwrap_or("").trim()
}

fn parse_list<T: FromStr>(node: Node) -> Result<Vec<T>, CanonicalError> {
    node_text(node).split_whitespace().map(|token| {
        token.parse::<T>().map_err(|_| {
            invalid_argument_error(&format!("Bad value '{}' in <{}>",
                                            token, node.tag_name().name()))
        })
    }).collect()
}

fn parse_one<T: FromStr>(node: Node) -> Result<T, CanonicalError> {
    let mut values = parse_list::<T>(node)?;
    if values.len() != 1 {
        return Err(invalid_argument_error(
            &format!("Expected one value in <{}>", node.tag_name().name())));
    }
    Ok(values.remove(0))
}

fn parse_feature(node: Node, win_w: u32, win_h: u32)
                 -> Result<HaarFeature, CanonicalError> {
    if let Some(tilted) = node.children().find(|n| n.has_tag_name("tilted")) {
        if node_text(tilted) != "0" {
            return Err(invalid_argument_error("Tilted Haar features are not supported"));
        }
    }
    let mut rects = Vec::<HaarRect>::new();
    for rect_node in items(child(node, "rects")?) {
        let values = parse_list::<f32>(rect_node)?;
        if values.len() != 5 || values[..4].iter().any(|v| *v < 0.0) {
            return Err(invalid_argument_error(
                &format!("Bad feature rect '{}'", node_text(rect_node))));
        }
        let rect = HaarRect{
            x: values[0] as u32,
            y: values[1] as u32,
            width: values[2] as u32,
            height: values[3] as u32,
            weight: values[4],
        };
        if rect.x + rect.width > win_w || rect.y + rect.height > win_h {
            return Err(invalid_argument_error(
                &format!("Feature rect '{}' exceeds window", node_text(rect_node))));
        }
        rects.push(rect);
    }
    if rects.is_empty() {
        return Err(invalid_argument_error("Feature without rects"));
    }
    Ok(HaarFeature{rects})
}

fn parse_weak_classifier(node: Node, num_features: usize)
                         -> Result<WeakClassifier, CanonicalError> {
    let raw_nodes = parse_list::<f64>(child(node, "internalNodes")?)?;
    let leaves = parse_list::<f32>(child(node, "leafValues")?)?;
    if raw_nodes.is_empty() || raw_nodes.len() % 4 != 0 {
        return Err(invalid_argument_error(
            &format!("internalNodes has {} values, expected a multiple of 4",
                     raw_nodes.len())));
    }
    let mut nodes = Vec::<TreeNode>::new();
    for (i, chunk) in raw_nodes.chunks(4).enumerate() {
        let tree_node = TreeNode{
            left: chunk[0] as i32,
            right: chunk[1] as i32,
            feature: chunk[2] as usize,
            threshold: chunk[3] as f32,
        };
        if tree_node.feature >= num_features {
            return Err(invalid_argument_error(
                &format!("Feature index {} out of range", tree_node.feature)));
        }
        for next in [tree_node.left, tree_node.right] {
            // Children must come later in the node list (so evaluation
            // terminates) or name an existing leaf.
            let valid = if next > 0 {
                (next as usize) > i && (next as usize) < raw_nodes.len() / 4
            } else {
                ((-next) as usize) < leaves.len()
            };
            if !valid {
                return Err(invalid_argument_error(
                    &format!("Bad tree link {} at node {}", next, i)));
            }
        }
        nodes.push(tree_node);
    }
    Ok(WeakClassifier{nodes, leaves})
}

// mod tests.
