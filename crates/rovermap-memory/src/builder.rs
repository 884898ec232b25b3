//! Observation → signature pipeline.
//!
//! One deterministic pass per observation: validate, assign an id, extract
//! and describe keypoints (stereo, depth or RGB-only mode), quantize through
//! the dictionary (whose index rebuild may run concurrently with
//! extraction), recover 3-D words, decimate and compress the retained
//! payload, and assemble the [`Signature`].
//!
//! Intermediate observations (negative id or empty image) skip extraction
//! entirely and yield a weight -1 node kept only for path continuity.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use rovermap_core::{
    CameraModel, Descriptors, Image, KeyPoint, PixelFormat, SensorData, SensorPayload,
    StereoCameraModel, Transform, Vec3,
};
use rovermap_vision::feature::{Roi, filter_keypoints_by_depth};
use rovermap_vision::points3d::{
    keypoints3d_from_depth, keypoints3d_from_stereo, words3d_mono,
};

use crate::memory::Memory;
use crate::signature::Signature;
use crate::stats::Statistics;
use crate::MemoryError;

/// Raw extraction output, before quantization.
struct Extraction {
    keypoints: Vec<KeyPoint>,
    descriptors: Descriptors,
    /// 3-D point per keypoint (NaN = unknown); empty when no depth source.
    points3: Vec<Vec3>,
}

impl Memory {
    /// Build a signature from one observation.  The signature is not yet
    /// inserted into any tier.
    pub fn create_signature(
        &mut self,
        data: SensorData,
        pose: Option<Transform>,
        mut stats: Option<&mut Statistics>,
    ) -> Result<Signature, MemoryError> {
        validate(&data)?;

        let is_intermediate = data.id < 0 || data.image.is_empty();
        let id = if self.config.generate_ids {
            self.next_id()
        } else if data.id <= 0 {
            return Err(MemoryError::BadInput(
                "the source provided no observation id; enable id generation \
                 or supply increasing ids"
                    .to_string(),
            ));
        } else if data.id > self.id_count {
            self.id_count = data.id;
            data.id
        } else {
            return Err(MemoryError::IdOrder {
                received: data.id,
                current: self.id_count,
            });
        };

        let tree_size = self.wm.len() + self.stm.len();
        let mean_words_per_location = if tree_size > 0 {
            self.vwd.total_active_references() / tree_size
        } else {
            0
        };

        // Rebuild the dictionary index concurrently with extraction; the
        // task must complete before quantization.
        let mut extraction;
        if self.config.kp_parallelized {
            let mut dictionary = std::mem::take(&mut self.vwd);
            let (dictionary, extracted) = std::thread::scope(|scope| {
                let update = scope.spawn(move || {
                    dictionary.update();
                    dictionary
                });
                let extracted = self.extract(&data, is_intermediate);
                (update.join().expect("dictionary update task"), extracted)
            });
            self.vwd = dictionary;
            extraction = extracted;
        } else {
            extraction = self.extract(&data, is_intermediate);
        }

        // Feature-starved frames carry no words at all.
        let rows = extraction.descriptors.rows();
        if rows > 0 && (rows as f32) < self.config.kp_bad_sign_ratio * mean_words_per_location as f32
        {
            debug!(id, rows, mean_words_per_location, "bad signature");
            extraction.descriptors.clear();
        }

        let word_ids = self.vwd.quantize(&extraction.descriptors, id);
        if let Some(stats) = stats.as_deref_mut() {
            stats.add("memory/keypoints", extraction.keypoints.len() as f32);
            stats.add("memory/word_ids", word_ids.len() as f32);
        }

        // words / words3, with keypoints rescaled to the retained imagery.
        let decimation = self.config.image_decimation;
        let keypoint_scale = if decimation > 1 {
            1.0 / decimation as f32
        } else {
            1.0
        };
        let mut words: BTreeMap<i32, Vec<KeyPoint>> = BTreeMap::new();
        let mut words3: BTreeMap<i32, Vec<Vec3>> = BTreeMap::new();
        if !word_ids.is_empty() {
            assert_eq!(word_ids.len(), extraction.keypoints.len());
            assert!(
                extraction.points3.is_empty()
                    || extraction.points3.len() == word_ids.len()
            );
            for (index, &word_id) in word_ids.iter().enumerate() {
                let keypoint = extraction.keypoints[index].scaled(keypoint_scale);
                words.entry(word_id).or_default().push(keypoint);
                if !extraction.points3.is_empty() {
                    words3
                        .entry(word_id)
                        .or_default()
                        .push(extraction.points3[index]);
                }
            }
        } else if id > 0 && !is_intermediate {
            debug!(id, "signature has no words");
        }

        // Monocular 3-D recovery through the previous signature.
        if words.len() > 8
            && words3.is_empty()
            && pose.is_some()
            && data.camera_models.len() == 1
            && !self.signatures.is_empty()
        {
            self.recover_words3_mono(
                &mut words3,
                &words,
                &data.camera_models[0],
                pose.as_ref().expect("checked"),
            );
        }

        // Retained payload: decimate, downsample, compress.
        let SensorData {
            mut image,
            mut depth_or_right,
            mut camera_models,
            mut stereo_model,
            laser_scan,
            user_data,
            stamp,
            ..
        } = data;
        let keep_any = self.config.raw_data_kept || self.config.bin_data_kept;
        if keep_any && decimation > 1 {
            image = image.decimate(decimation);
            depth_or_right = depth_or_right.decimate(decimation);
            let factor = 1.0 / decimation as f32;
            for model in &mut camera_models {
                model.scale(factor);
            }
            if let Some(stereo) = &mut stereo_model {
                stereo.scale(factor);
            }
        }
        let scan_step = self.config.laser_scan_downsample_step_size;
        let laser_scan = if scan_step > 1 {
            laser_scan.downsample(scan_step)
        } else {
            laser_scan
        };

        let mut payload = SensorPayload {
            scan_max_points: laser_scan.max_points,
            scan_max_range: laser_scan.max_range,
            camera_models,
            stereo_model,
            ..Default::default()
        };
        if self.config.bin_data_kept {
            if self.config.save_depth_16_format
                && depth_or_right.format == PixelFormat::Depth32F
            {
                warn!(
                    id,
                    "converting float depth to 16-bit millimetres before compression"
                );
                depth_or_right = depth_or_right.depth_to_16u();
            }
            let codec = Arc::clone(&self.codec);
            let scan_blob = laser_scan.to_blob();
            let (image_blob, depth_blob, scan_blob, user_blob) =
                std::thread::scope(|scope| {
                    let image_task = scope.spawn(|| codec.encode(&image.to_blob()));
                    let depth_task = scope.spawn(|| codec.encode(&depth_or_right.to_blob()));
                    let scan_task = scope.spawn(|| codec.encode(&scan_blob));
                    let user_task = scope.spawn(|| codec.encode(&user_data));
                    (
                        image_task.join().expect("image compression task"),
                        depth_task.join().expect("depth compression task"),
                        scan_task.join().expect("scan compression task"),
                        user_task.join().expect("user-data compression task"),
                    )
                });
            payload.image = image_blob;
            payload.depth_or_right = depth_blob;
            payload.scan = scan_blob;
            payload.user_data = user_blob;
        }
        if self.config.raw_data_kept {
            payload.raw_image = image;
            payload.raw_depth_or_right = depth_or_right;
            payload.raw_scan = laser_scan;
            payload.raw_user_data = user_data;
        }

        let mut signature = Signature::new(
            id,
            self.id_map_count,
            if is_intermediate { -1 } else { 0 },
            stamp,
            pose,
        );
        signature.set_words(words);
        signature.set_words3(words3);
        signature.set_payload(payload);
        if !signature.words().is_empty() {
            // All references are already registered by quantization.
            signature.set_enabled(true);
        }
        Ok(signature)
    }

    // ── extraction ──────────────────────────────────────────────────────────

    fn extract(&self, data: &SensorData, is_intermediate: bool) -> Extraction {
        let empty = Extraction {
            keypoints: Vec::new(),
            descriptors: Descriptors::empty(),
            points3: Vec::new(),
        };
        if is_intermediate {
            debug!("intermediate node, no features extracted");
            return empty;
        }
        if !data.keypoints.is_empty() {
            return self.extract_preset(data);
        }
        if self.detector.max_features() < 0 || data.image.is_empty() {
            debug!("feature extraction disabled");
            return empty;
        }

        let gray = data.image.to_gray();
        let roi = Roi::from_ratios(&gray, &self.roi_ratios);
        let subpixel =
            self.config.kp_sub_pix_win_size > 0 && self.config.kp_sub_pix_iterations > 0;

        let stereo_mode = !data.depth_or_right.is_empty()
            && data.stereo_model.as_ref().is_some_and(StereoCameraModel::is_valid);
        let depth_mode = !stereo_mode
            && !data.depth_or_right.is_empty()
            && !data.camera_models.is_empty();

        let mut keypoints = self.detector.detect(&gray, &roi);
        debug!(count = keypoints.len(), "keypoints detected");
        if keypoints.is_empty() {
            return empty;
        }

        if stereo_mode {
            // Descriptors are extracted before the sub-pixel shift.
            let descriptors = self.detector.describe(&gray, &keypoints);
            if subpixel {
                self.refine(&gray, &mut keypoints);
            }
            let stereo_model = data.stereo_model.as_ref().expect("checked");
            let left: Vec<(f32, f32)> = keypoints.iter().map(|kp| (kp.x, kp.y)).collect();
            let (right, mut status) =
                self.stereo
                    .correspondences(&gray, &data.depth_or_right, &left);
            self.filter_stereo_depth(stereo_model, &left, &right, &mut status);
            let points3 = keypoints3d_from_stereo(&left, &right, &status, stereo_model);
            Extraction {
                keypoints,
                descriptors,
                points3,
            }
        } else if depth_mode {
            let mut descriptors = Descriptors::empty();
            if subpixel {
                descriptors = self.detector.describe(&gray, &keypoints);
                self.refine(&gray, &mut keypoints);
            }
            let (keypoints, descriptors) = filter_keypoints_by_depth(
                keypoints,
                descriptors,
                &data.depth_or_right,
                self.config.kp_min_depth,
                self.config.kp_max_depth,
            );
            let descriptors = if subpixel || keypoints.is_empty() {
                descriptors
            } else {
                self.detector.describe(&gray, &keypoints)
            };
            let points3 =
                keypoints3d_from_depth(&keypoints, &data.depth_or_right, &data.camera_models);
            Extraction {
                keypoints,
                descriptors,
                points3,
            }
        } else {
            let descriptors = self.detector.describe(&gray, &keypoints);
            if subpixel {
                self.refine(&gray, &mut keypoints);
            }
            Extraction {
                keypoints,
                descriptors,
                points3: Vec::new(),
            }
        }
    }

    /// Preset keypoints/descriptors: skip detection, still recover 3-D.
    fn extract_preset(&self, data: &SensorData) -> Extraction {
        let keypoints = data.keypoints.clone();
        let descriptors = data.descriptors.clone();
        if !data.depth_or_right.is_empty()
            && data.stereo_model.as_ref().is_some_and(StereoCameraModel::is_valid)
            && !data.image.is_empty()
        {
            let gray = data.image.to_gray();
            let stereo_model = data.stereo_model.as_ref().expect("checked");
            let left: Vec<(f32, f32)> = keypoints.iter().map(|kp| (kp.x, kp.y)).collect();
            let (right, mut status) =
                self.stereo
                    .correspondences(&gray, &data.depth_or_right, &left);
            self.filter_stereo_depth(stereo_model, &left, &right, &mut status);
            let points3 = keypoints3d_from_stereo(&left, &right, &status, stereo_model);
            Extraction {
                keypoints,
                descriptors,
                points3,
            }
        } else if !data.depth_or_right.is_empty() && !data.camera_models.is_empty() {
            let (keypoints, descriptors) = filter_keypoints_by_depth(
                keypoints,
                descriptors,
                &data.depth_or_right,
                self.config.kp_min_depth,
                self.config.kp_max_depth,
            );
            let points3 =
                keypoints3d_from_depth(&keypoints, &data.depth_or_right, &data.camera_models);
            Extraction {
                keypoints,
                descriptors,
                points3,
            }
        } else {
            Extraction {
                keypoints,
                descriptors,
                points3: Vec::new(),
            }
        }
    }

    fn refine(&self, gray: &Image, keypoints: &mut [KeyPoint]) {
        self.detector.refine_subpixel(
            gray,
            keypoints,
            self.config.kp_sub_pix_win_size,
            self.config.kp_sub_pix_iterations,
            self.config.kp_sub_pix_eps,
        );
    }

    /// Invalidate stereo correspondences whose depth falls outside the
    /// configured range.
    fn filter_stereo_depth(
        &self,
        stereo_model: &StereoCameraModel,
        left: &[(f32, f32)],
        right: &[(f32, f32)],
        status: &mut [bool],
    ) {
        let (min_depth, max_depth) = (self.config.kp_min_depth, self.config.kp_max_depth);
        if min_depth <= 0.0 && max_depth <= 0.0 {
            return;
        }
        for ((l, r), ok) in left.iter().zip(right).zip(status.iter_mut()) {
            if !*ok {
                continue;
            }
            match stereo_model.depth_from_disparity(l.0 - r.0) {
                Some(depth) => {
                    if (min_depth > 0.0 && depth < min_depth)
                        || (max_depth > 0.0 && depth > max_depth)
                    {
                        *ok = false;
                    }
                }
                None => *ok = false,
            }
        }
    }

    /// Triangulate shared words against the previous signature; every word
    /// of the new signature gets a words3 entry, NaN when not recovered.
    fn recover_words3_mono(
        &self,
        words3: &mut BTreeMap<i32, Vec<Vec3>>,
        words: &BTreeMap<i32, Vec<KeyPoint>>,
        model: &CameraModel,
        pose: &Transform,
    ) {
        let previous_id = self
            .signatures
            .keys()
            .max()
            .copied()
            .expect("checked non-empty");
        let previous = &self.signatures[&previous_id];
        let Some(previous_pose) = previous.pose() else {
            return;
        };
        if previous.words().len() <= 8 {
            return;
        }
        debug!(previous_id, "generating 3-D words from odometry");

        let first_instances = |map: &BTreeMap<i32, Vec<KeyPoint>>| -> BTreeMap<i32, KeyPoint> {
            map.iter()
                .filter_map(|(&word, kps)| kps.first().map(|kp| (word, *kp)))
                .collect()
        };
        let camera_a = pose.compose(&model.local_transform);
        let camera_b = previous_pose.compose(&model.local_transform);
        let camera_transform = camera_a.inverse().compose(&camera_b);

        let inliers = words3d_mono(
            &first_instances(words),
            &first_instances(previous.words()),
            model,
            &camera_transform,
        );
        for (&word, keypoints) in words {
            let point = inliers
                .get(&word)
                .map(|p| model.local_transform.apply(*p))
                .unwrap_or(Vec3::nan());
            words3.insert(word, vec![point; keypoints.len()]);
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Validation
// ────────────────────────────────────────────────────────────────────────────

fn validate(data: &SensorData) -> Result<(), MemoryError> {
    if !data.image.is_empty()
        && !matches!(data.image.format, PixelFormat::Gray8 | PixelFormat::Bgr8)
    {
        return Err(MemoryError::BadInput(format!(
            "camera image must be grayscale or colour, got {:?}",
            data.image.format
        )));
    }
    if data.depth_or_right.is_empty() {
        return Ok(());
    }
    match data.depth_or_right.format {
        PixelFormat::Depth16U | PixelFormat::Depth32F | PixelFormat::Gray8 => {}
        other => {
            return Err(MemoryError::BadInput(format!(
                "depth/right image must be 16-bit, float or 8-bit, got {other:?}"
            )));
        }
    }
    if data.image.is_empty() {
        if data.depth_or_right.format == PixelFormat::Gray8 {
            return Err(MemoryError::BadInput(
                "a right stereo image requires the left image".to_string(),
            ));
        }
    } else if data.depth_or_right.width != data.image.width
        || data.depth_or_right.height != data.image.height
    {
        return Err(MemoryError::BadInput(format!(
            "depth/right size {}x{} does not match image {}x{}",
            data.depth_or_right.width,
            data.depth_or_right.height,
            data.image.width,
            data.image.height
        )));
    }
    if data.camera_models.is_empty()
        && !data.stereo_model.as_ref().is_some_and(StereoCameraModel::is_valid)
    {
        return Err(MemoryError::BadInput(
            "rectified depth or stereo input requires a valid calibration".to_string(),
        ));
    }
    Ok(())
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
