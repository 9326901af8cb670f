//! The energy loop: per-frame spot tracking, measurement and recalibration.
//!
//! For each frame:
//!
//! 1. rescale the model to the frame energy and enumerate the visible reflexes
//! 2. mark desired / reference / excluded membership
//! 3. refine positions and integrate at the good-S/N threshold
//! 4. retry the spots that failed: back to the prediction, a narrower peak
//!    search, integration at the bad-S/N threshold
//! 5. collect the desired intensities
//! 6. fit a lattice candidate to the trustworthy spots and blend it into the
//!    model; when it deviates too far the frame is also rejected, processed
//!    again from the blended model, and no row is emitted

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::beam::BeamCurrentTracker;
use super::fit::{BasisEstimator, FitPoint, TripleFit, TripleFitConfig};
use super::policy::{AcceptancePolicy, Verdict};
use crate::config::{IndexLists, RunConfig};
use crate::error::{MkivError, Result};
use crate::frame::{Frame, Image, ScreenRegion};
use crate::geometry::{GeometryModel, ManualSpot};
use crate::integrate::{EllipseAperture, IntegrationSummary, IntensityIntegrator};
use crate::lattice::{spot_capacity, SpotEnumerator};
use crate::output::{IvRow, IvTable};
use crate::refine::{PeakRefiner, RefineKernel, RefineParams};
use crate::spot::{Spot, SpotState, INTENSITY_SENTINEL};

/// Peak search and S/N gating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Grid step of the first-pass local-maximum search.
    /// Default: 2
    pub step: usize,

    /// The retry pass searches within `range / retry_divisor` of the prediction.
    /// Default: 3.0
    pub retry_divisor: f64,

    /// S/N a spot needs in the first pass to count as measured.
    /// Default: 0.9
    pub s2n_good: f64,

    /// S/N threshold of the retry pass.
    /// Default: 0.2
    pub s2n_bad: f64,

    /// After the first pass, treat spots refined to within the retry radius of
    /// their prediction as done and skip their retry.
    /// Default: false
    pub keep_near_predicted: bool,

    /// Local-maximum kernel.
    /// Default: the 7×7 peaked kernel
    pub kernel: RefineKernel,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            step: 2,
            retry_divisor: 3.0,
            s2n_good: 0.9,
            s2n_bad: 0.2,
            keep_near_predicted: false,
            kernel: RefineKernel::default(),
        }
    }
}

/// Selection of recalibration spots and the fit/acceptance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecalibrationConfig {
    /// Minimum S/N of a spot used for recalibration.
    /// Default: 1.2
    pub s2n_ref: f64,

    /// Lower bound of the emergence-angle cosine of recalibration spots.
    /// Default: 0.6
    pub cos_min: f64,

    /// Upper bound of the emergence-angle cosine of recalibration spots.
    /// Default: 0.9
    pub cos_max: f64,

    /// When at least this many reference spots qualify, only reference spots
    /// are used.
    /// Default: 10
    pub ref_min: usize,

    /// Triple-fit settings.
    pub fit: TripleFitConfig,

    /// Expand positions by this constant factor instead of the per-spot
    /// curvature correction.
    /// Default: None
    pub fixed_correction: Option<f64>,

    /// Acceptance rule for fitted candidates.
    pub acceptance: AcceptancePolicy,
}

impl Default for RecalibrationConfig {
    fn default() -> Self {
        Self {
            s2n_ref: 1.2,
            cos_min: 0.6,
            cos_max: 0.9,
            ref_min: 10,
            fit: TripleFitConfig::default(),
            fixed_correction: None,
            acceptance: AcceptancePolicy::default(),
        }
    }
}

/// What happened to the geometry after a frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RecalibrationOutcome {
    /// Fewer than three spots qualified; the model is kept.
    InsufficientSpots { candidates: usize },
    /// No triple survived the filters; the model is kept.
    NoTriples { candidates: usize },
    /// Candidate blended into the model.
    Accepted { triples: usize, deviations: [f64; 3] },
    /// Candidate deviated too far. It is still blended in and the frame will
    /// be repeated from the moved model.
    Rejected {
        triples: usize,
        deviations: [f64; 3],
        repeat: u32,
    },
    /// Deviation too large but the repeat budget is spent; blended anyway.
    ForcedAccept { triples: usize, deviations: [f64; 3] },
}

impl RecalibrationOutcome {
    /// Whether the frame's row is emitted.
    pub fn emits_row(&self) -> bool {
        !matches!(self, RecalibrationOutcome::Rejected { .. })
    }
}

/// Everything learned from one pass over a frame.
#[derive(Debug, Clone)]
pub struct FrameReport {
    pub energy: f64,
    /// The frame's spots after both passes.
    pub spots: Vec<Spot>,
    pub first_pass: IntegrationSummary,
    pub retry_pass: IntegrationSummary,
    /// Desired intensities in configuration order, sentinel when unmeasured.
    pub intensities: Vec<f64>,
    /// Normalising beam current.
    pub beam_current: f64,
    pub outcome: RecalibrationOutcome,
    /// False when the frame was rejected and must be processed again.
    pub emitted: bool,
}

/// Loop state owned by the controller.
#[derive(Debug, Clone)]
pub struct CalibrationState {
    /// Energy of the frame being processed.
    pub energy: f64,
    /// Energy of the last emitted frame.
    pub previous_energy: Option<f64>,
    pub beam: BeamCurrentTracker,
    /// Rejections of the current frame so far.
    pub repeats: u32,
    pub table: IvTable,
}

/// Drives a tracking run over an energy series of frames.
///
/// Generic over the lattice estimator; [`TripleFit`] unless replaced with
/// [`CalibrationController::with_estimator`].
pub struct CalibrationController<E = TripleFit> {
    config: RunConfig,
    screen: ScreenRegion,
    model: GeometryModel,
    refiner: PeakRefiner,
    estimator: E,
    capacity: usize,
    // Frame size and energy the capacity was computed for.
    capacity_frame: (u32, u32),
    capacity_energy: f64,
    state: CalibrationState,
}

impl CalibrationController<TripleFit> {
    /// Validate the configuration and build the initial model from the
    /// operator-identified `reference_spots` at `start_energy`.
    ///
    /// `frame_size` sizes the spot list; an optional `mask` must match it.
    pub fn bootstrap(
        config: RunConfig,
        mask: Option<Image>,
        reference_spots: &[ManualSpot],
        start_energy: f64,
        frame_size: (u32, u32),
    ) -> Result<Self> {
        config.validate()?;
        let (width, height) = frame_size;
        if let Some(m) = &mask {
            if m.dimensions() != frame_size {
                return Err(MkivError::MaskSizeMismatch {
                    mask_width: m.width(),
                    mask_height: m.height(),
                    width,
                    height,
                });
            }
        }

        let model = GeometryModel::initialize_from_spots(
            reference_spots,
            start_energy,
            config.geometry.clone(),
            &config.recalibration.fit,
        )?;
        let capacity_energy = config.lattice.capacity_energy.max(start_energy);
        let capacity = spot_capacity(&model, &config.domains, width, height, capacity_energy)?;
        info!(
            "Bootstrapped lattice at {:.1} eV from {} spots: origin=({:.1}, {:.1}), |a1|={:.2}, |a2|={:.2}, capacity {}",
            start_energy,
            reference_spots.len(),
            model.origin.x,
            model.origin.y,
            model.basis1.norm(),
            model.basis2.norm(),
            capacity
        );

        let estimator = TripleFit {
            config: config.recalibration.fit.clone(),
            ratio: config.lattice.ratio,
            fixed_factor: config.recalibration.fixed_correction,
        };
        let screen = ScreenRegion::new(&config.screen, mask);
        let state = CalibrationState {
            energy: start_energy,
            previous_energy: None,
            beam: BeamCurrentTracker::new(config.beam.clone()),
            repeats: 0,
            table: IvTable::new(config.indices.desired.clone()),
        };
        Ok(Self {
            refiner: PeakRefiner::new(config.search.kernel.clone()),
            config,
            screen,
            model,
            estimator,
            capacity,
            capacity_frame: frame_size,
            capacity_energy,
            state,
        })
    }
}

impl<E: BasisEstimator> CalibrationController<E> {
    /// Replace the lattice estimator.
    pub fn with_estimator<F: BasisEstimator>(self, estimator: F) -> CalibrationController<F> {
        CalibrationController {
            config: self.config,
            screen: self.screen,
            model: self.model,
            refiner: self.refiner,
            estimator,
            capacity: self.capacity,
            capacity_frame: self.capacity_frame,
            capacity_energy: self.capacity_energy,
            state: self.state,
        }
    }

    pub fn model(&self) -> &GeometryModel {
        &self.model
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Maximum number of spots per frame.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn table(&self) -> &IvTable {
        &self.state.table
    }

    pub fn into_table(self) -> IvTable {
        self.state.table
    }

    /// Process every frame in order, repeating rejected frames, and return
    /// the I(V) table.
    pub fn run<I: IntoIterator<Item = Frame>>(mut self, frames: I) -> Result<IvTable> {
        for frame in frames {
            while !self.process_frame(&frame)?.emitted {}
        }
        info!("Run finished: {} rows", self.state.table.len());
        Ok(self.into_table())
    }

    /// One pass over `frame`. When the report says `emitted == false` the
    /// frame was rejected and should be passed in again.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<FrameReport> {
        self.screen.check_frame(&frame.image)?;
        let (width, height) = frame.image.dimensions();
        let energy = frame.energy;
        self.state.energy = energy;

        // ── Step 1: geometry at this energy ──
        self.model.rescale(energy)?;
        self.ensure_capacity(width, height, energy)?;
        let beam_current = self.state.beam.current_for(frame.beam_current);

        // ── Step 2: candidate spots ──
        let mut spots = SpotEnumerator::new(
            &self.config.lattice,
            &self.config.domains,
            &self.config.indices.excluded,
            &self.screen,
            self.capacity,
        )
        .enumerate(&self.model, width, height)?;
        let desired_slots = mark_membership(&mut spots, &self.config.indices);

        // ── Step 3: refine and integrate ──
        let search = &self.config.search;
        let range = self.model.search_range;
        let aperture = EllipseAperture::new(
            &self.model.aperture,
            self.config.aperture.angle_deg,
            self.config.aperture.background_ratio,
        );
        let integrator = IntensityIntegrator::new(&self.config.aperture, &self.screen);

        self.refiner.refine(
            &mut spots,
            &frame.image,
            &RefineParams {
                range,
                step: search.step,
                centroid_range: range,
            },
        );
        let first_pass =
            integrator.integrate(&mut spots, &frame.image, &aperture, beam_current, search.s2n_good);

        // ── Step 4: retry weak spots from their prediction ──
        let retry_range = range / search.retry_divisor;
        for spot in spots.iter_mut().filter(|s| !s.is_gated()) {
            if search.keep_near_predicted
                && spot.state == SpotState::Measured
                && spot.offset_from_predicted() < retry_range
            {
                spot.state = SpotState::Gated;
                continue;
            }
            spot.reset_to_predicted();
        }
        self.refiner.refine(
            &mut spots,
            &frame.image,
            &RefineParams {
                range: retry_range,
                step: 1,
                centroid_range: range,
            },
        );
        let retry_pass =
            integrator.integrate(&mut spots, &frame.image, &aperture, beam_current, search.s2n_bad);

        // ── Step 5: desired intensities ──
        let intensities: Vec<f64> = desired_slots
            .iter()
            .map(|slot| slot.map_or(INTENSITY_SENTINEL, |i| spots[i].intensity))
            .collect();

        // ── Step 6: recalibration ──
        let outcome = self.recalibrate(&spots);
        let emitted = outcome.emits_row();
        if emitted {
            self.state.beam.commit(frame.beam_current);
            self.state.table.push(IvRow {
                energy,
                intensities: intensities.clone(),
                beam_raw: frame.beam_current,
                beam_used: beam_current,
            });
            self.state.previous_energy = Some(energy);
            self.state.repeats = 0;
        } else {
            self.state.repeats += 1;
        }

        info!(
            "E = {:.1} eV: {} spots, {} gated ({} on retry), I0 = {:.1} -> {:?}",
            energy,
            spots.len(),
            first_pass.gated + retry_pass.gated,
            retry_pass.gated,
            beam_current,
            outcome
        );

        Ok(FrameReport {
            energy,
            spots,
            first_pass,
            retry_pass,
            intensities,
            beam_current,
            outcome,
            emitted,
        })
    }

    /// Grow the spot-list capacity for frames larger or energies higher than
    /// it was computed for.
    fn ensure_capacity(&mut self, width: u32, height: u32, energy: f64) -> Result<()> {
        let (cap_w, cap_h) = self.capacity_frame;
        if width <= cap_w && height <= cap_h && energy <= self.capacity_energy {
            return Ok(());
        }
        let frame = (width.max(cap_w), height.max(cap_h));
        let capacity_energy = self.capacity_energy.max(energy);
        let capacity = spot_capacity(
            &self.model,
            &self.config.domains,
            frame.0,
            frame.1,
            capacity_energy,
        )?;
        debug!(
            "Spot capacity {} -> {} for {}x{} at {:.1} eV",
            self.capacity, capacity, frame.0, frame.1, capacity_energy
        );
        self.capacity = self.capacity.max(capacity);
        self.capacity_frame = frame;
        self.capacity_energy = capacity_energy;
        Ok(())
    }

    fn recalibrate(&mut self, spots: &[Spot]) -> RecalibrationOutcome {
        let points = select_recalibration_spots(spots, &self.config.recalibration);
        if points.len() < 3 {
            debug!(
                "Recalibration skipped: {} qualifying spots",
                points.len()
            );
            return RecalibrationOutcome::InsufficientSpots {
                candidates: points.len(),
            };
        }

        let fit = self.estimator.estimate(&points, &self.model);
        let Some(candidate) = fit.estimate else {
            debug!("Recalibration skipped: no valid triple among {} spots", points.len());
            return RecalibrationOutcome::NoTriples {
                candidates: points.len(),
            };
        };

        let policy = &self.config.recalibration.acceptance;
        let deviations = self.model.deviations(&candidate);
        let triples = fit.triples_used;
        let outcome = match policy.judge(&deviations, self.state.repeats) {
            Verdict::Accept => RecalibrationOutcome::Accepted {
                triples,
                deviations,
            },
            Verdict::Reject => {
                debug!(
                    "Deviation {:?} above {:.2}, repeating the frame from the blended model",
                    deviations, policy.max_deviation
                );
                RecalibrationOutcome::Rejected {
                    triples,
                    deviations,
                    repeat: self.state.repeats + 1,
                }
            }
            Verdict::ForceAccept => {
                warn!(
                    "Deviation {:?} still above {:.2} after {} repeats at {:.1} eV, accepting",
                    deviations, policy.max_deviation, self.state.repeats, self.model.reference_energy
                );
                RecalibrationOutcome::ForcedAccept {
                    triples,
                    deviations,
                }
            }
        };

        if !self.model.blend(&candidate, policy.blend_factor) {
            warn!("Blended lattice would be degenerate, keeping the current model");
        }
        outcome
    }
}

/// Set list membership on every spot and return, for each desired index, the
/// position of its spot in `spots` (`None` when it is not on screen).
pub fn mark_membership(spots: &mut [Spot], indices: &IndexLists) -> Vec<Option<usize>> {
    for spot in spots.iter_mut() {
        spot.membership.desired = indices.desired.iter().any(|d| d.matches(&spot.index));
        spot.membership.reference = indices.reference.iter().any(|r| r.matches(&spot.index));
        spot.membership.excluded = indices.excluded.iter().any(|e| e.matches(&spot.index));
    }
    indices
        .desired
        .iter()
        .map(|d| spots.iter().position(|s| d.matches(&s.index)))
        .collect()
}

/// Spots trusted enough to recalibrate from: S/N at least `s2n_ref`, emergence
/// cosine inside `[cos_min, cos_max]`, and restricted to reference spots when
/// enough of those qualify.
pub fn select_recalibration_spots(spots: &[Spot], config: &RecalibrationConfig) -> Vec<FitPoint> {
    let qualified: Vec<&Spot> = spots
        .iter()
        .filter(|s| {
            matches!(s.state, SpotState::Gated | SpotState::Measured)
                && s.signal_to_noise >= config.s2n_ref
                && s.cos_theta >= config.cos_min
                && s.cos_theta <= config.cos_max
        })
        .collect();
    let n_reference = qualified.iter().filter(|s| s.membership.reference).count();
    let use_reference_only = n_reference >= config.ref_min;

    qualified
        .into_iter()
        .filter(|s| !use_reference_only || s.membership.reference)
        .map(|s| FitPoint {
            index: s.index,
            position: s.position,
            cos_theta: s.cos_theta,
            priority: s.signal_to_noise,
        })
        .collect()
}
