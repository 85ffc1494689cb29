// bathy_sim/src/simulation/runner.rs

use anyhow::{anyhow, Context};
use bathy_core::estimation::FrameAnchors;
use bathy_core::slam::{BathySlam, EstimateSnapshot, PingReport};
use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::select;
use log::{debug, info, warn};
use nalgebra::Isometry3;
use rand_chacha::ChaCha8Rng;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::simulation::config::ScenarioConfig;
use crate::simulation::prng::SimulationRng;
use crate::simulation::seabed::Seabed;
use crate::simulation::sonar::{MultibeamSonar, SeabedRaycaster};
use crate::simulation::survey::{OdometrySensor, SurveyPlan, Vehicle};
use crate::simulation::transforms::{StaticTfTree, BASE_FRAME, MAP_FRAME, MBES_FRAME, ODOM_FRAME};

/// Requests delivered to the worker between pings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    SetEnabled(bool),
    Flush,
    Shutdown,
}

/// One simulated ping and what the system made of it.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub timestamp: f64,
    pub truth: Isometry3<f64>,
    pub estimate: Isometry3<f64>,
    pub dead_reckoning: Isometry3<f64>,
    pub report: PingReport,
}

impl StepRecord {
    pub fn error(&self) -> f64 {
        (self.estimate.translation.vector - self.truth.translation.vector).norm()
    }

    pub fn dead_reckoning_error(&self) -> f64 {
        (self.dead_reckoning.translation.vector - self.truth.translation.vector).norm()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub pings: usize,
    pub resamples: usize,
    pub submaps: usize,
    pub landmarks: usize,
    pub loop_closures: usize,
    /// RMS position error of the published estimate (m).
    pub rms_error: f64,
    /// RMS position error of pure dead reckoning (m).
    pub dead_reckoning_rms_error: f64,
    pub final_error: f64,
    pub final_dead_reckoning_error: f64,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pings:          {}", self.pings)?;
        writeln!(f, "resamples:      {}", self.resamples)?;
        writeln!(f, "submaps:        {}", self.submaps)?;
        writeln!(f, "landmarks:      {}", self.landmarks)?;
        writeln!(f, "loop closures:  {}", self.loop_closures)?;
        writeln!(
            f,
            "rms error:      {:.3} m (dead reckoning {:.3} m)",
            self.rms_error, self.dead_reckoning_rms_error
        )?;
        write!(
            f,
            "final error:    {:.3} m (dead reckoning {:.3} m)",
            self.final_error, self.final_dead_reckoning_error
        )
    }
}

/// A scripted survey over a synthetic seabed, fed one ping at a time into
/// the SLAM system.
pub struct Simulation {
    slam: BathySlam,
    world: SeabedRaycaster,
    plan: SurveyPlan,
    vehicle: Vehicle,
    odometry: OdometrySensor,
    rng: ChaCha8Rng,
    period: f64,
    end_time: f64,
    pings: usize,
    resamples: usize,
    squared_error: f64,
    squared_dead_reckoning_error: f64,
    last: Option<StepRecord>,
}

impl Simulation {
    pub fn new(config: ScenarioConfig) -> anyhow::Result<Self> {
        let mut prng = SimulationRng::new(config.simulation.seed);
        let seabed = Seabed::generate(&config.seabed, &mut prng.fork());
        let sonar = MultibeamSonar::new(&config.sonar)?;
        let start = config.survey.start.to_isometry();

        let mut tf = StaticTfTree::new();
        tf.insert(MAP_FRAME, ODOM_FRAME, start);
        tf.insert(BASE_FRAME, MBES_FRAME, *sonar.mount());
        let anchors = FrameAnchors::lookup(&tf, MAP_FRAME, ODOM_FRAME, BASE_FRAME, MBES_FRAME)
            .ok_or_else(|| anyhow!("frame anchors missing from the transform tree"))?;

        let mut slam_config = config.slam.clone();
        if slam_config.filter.seed.is_none() {
            slam_config.filter.seed = Some(prng.next_seed());
        }
        let slam = BathySlam::new(slam_config, anchors).context("failed to build SLAM system")?;

        let plan = SurveyPlan::lawnmower(&config.survey);
        let end_time = plan.duration().min(config.simulation.duration_seconds);
        info!(
            "Simulation ready: {} mounds, {:.0} s survey, {} particles",
            seabed.mounds().len(),
            end_time,
            config.slam.filter.particle_count
        );

        Ok(Self {
            slam,
            world: SeabedRaycaster::new(seabed, sonar),
            plan,
            vehicle: Vehicle::new(start),
            odometry: OdometrySensor::new(&config.odometry)?,
            rng: prng.fork(),
            period: 1.0 / config.simulation.ping_rate,
            end_time,
            pings: 0,
            resamples: 0,
            squared_error: 0.0,
            squared_dead_reckoning_error: 0.0,
            last: None,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.pings as f64 * self.period > self.end_time
    }

    /// Moves the vehicle one ping period, captures a ping and processes it.
    pub fn step(&mut self) -> anyhow::Result<&StepRecord> {
        let t = self.pings as f64 * self.period;
        let leg = self
            .plan
            .leg_at((t - 0.5 * self.period).max(0.0))
            .copied()
            .unwrap_or_default();
        if self.pings > 0 {
            self.vehicle.advance(&leg.linear, &leg.angular, self.period);
        }
        let truth = self.vehicle.map_pose();

        let odometry = self.odometry.measure(&leg, t, &mut self.rng);
        let reading = self.world.capture(&truth, t, &mut self.rng);
        let report = self
            .slam
            .process_ping(&odometry, reading, &self.world)
            .with_context(|| format!("ping at t={:.2} failed", t))?;

        if report.resample.resampled {
            self.resamples += 1;
        }
        if let Some(submap) = &report.submap {
            debug!(
                "t={:.1}: submap {} -> x{}, {} landmarks, {} loop closures",
                t,
                submap.submap_id,
                submap.pose_index,
                submap.landmarks,
                submap.loop_closures.len()
            );
        }

        let record = StepRecord {
            timestamp: t,
            truth,
            estimate: self.slam.corrected_pose(),
            dead_reckoning: self.slam.filter().dead_reckoning_map_pose(),
            report,
        };
        self.squared_error += record.error().powi(2);
        self.squared_dead_reckoning_error += record.dead_reckoning_error().powi(2);
        self.pings += 1;
        Ok(&*self.last.insert(record))
    }

    /// Returns `false` once the run should stop.
    pub fn apply(&mut self, command: ControlCommand) -> anyhow::Result<bool> {
        info!("Control command: {:?}", command);
        match command {
            ControlCommand::SetEnabled(enabled) => self.slam.set_enabled(enabled),
            ControlCommand::Flush => {
                self.slam.flush()?;
            }
            ControlCommand::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    pub fn snapshot(&self) -> EstimateSnapshot {
        self.slam.snapshot()
    }

    pub fn slam(&self) -> &BathySlam {
        &self.slam
    }

    /// Closes the last submap and summarizes the run.
    pub fn finish(mut self) -> anyhow::Result<RunSummary> {
        self.slam.flush().context("final flush failed")?;
        let n = self.pings.max(1) as f64;
        let (final_error, final_dead_reckoning_error) = self
            .last
            .as_ref()
            .map_or((0.0, 0.0), |r| (r.error(), r.dead_reckoning_error()));
        Ok(RunSummary {
            pings: self.pings,
            resamples: self.resamples,
            submaps: self.slam.submaps().len(),
            landmarks: self.slam.graph().landmarks().len(),
            loop_closures: self.slam.graph().loop_closures().len(),
            rms_error: (self.squared_error / n).sqrt(),
            dead_reckoning_rms_error: (self.squared_dead_reckoning_error / n).sqrt(),
            final_error,
            final_dead_reckoning_error,
        })
    }

    /// Steps until the survey ends or a `Shutdown` arrives, applying
    /// commands between pings.
    pub fn run(
        mut self,
        commands: &Receiver<ControlCommand>,
        pacer: Option<&Receiver<Instant>>,
    ) -> anyhow::Result<RunSummary> {
        'outer: while !self.is_finished() {
            for command in commands.try_iter() {
                if !self.apply(command)? {
                    break 'outer;
                }
            }
            if let Some(pacer) = pacer {
                if pacer.recv().is_err() {
                    warn!("Ping pacer disconnected, stopping the survey");
                    break;
                }
            }
            self.step()?;
        }
        self.finish()
    }
}

/// The simulation on a worker thread plus a periodic pose broadcaster.
pub struct SimulationNode {
    control: Sender<ControlCommand>,
    worker: JoinHandle<anyhow::Result<RunSummary>>,
    broadcaster: JoinHandle<usize>,
}

impl SimulationNode {
    pub fn spawn(config: ScenarioConfig) -> anyhow::Result<Self> {
        let realtime = config.simulation.realtime;
        let ping_period = Duration::from_secs_f64(1.0 / config.simulation.ping_rate);
        let broadcast_period = Duration::from_secs_f64(config.simulation.broadcast_period);

        let simulation = Simulation::new(config)?;
        let snapshot = simulation.snapshot();
        let (control_tx, control_rx) = channel::unbounded();
        // Dropped by the worker when it exits, which stops the broadcaster.
        let (done_tx, done_rx) = channel::bounded::<()>(0);

        let worker = thread::Builder::new()
            .name("slam".into())
            .spawn(move || {
                let pacer = realtime.then(|| channel::tick(ping_period));
                let summary = simulation.run(&control_rx, pacer.as_ref());
                drop(done_tx);
                summary
            })
            .context("failed to spawn the SLAM worker")?;

        let broadcaster = thread::Builder::new()
            .name("broadcast".into())
            .spawn(move || broadcast_loop(&snapshot, broadcast_period, &done_rx))
            .context("failed to spawn the broadcaster")?;

        Ok(Self {
            control: control_tx,
            worker,
            broadcaster,
        })
    }

    pub fn send(&self, command: ControlCommand) -> anyhow::Result<()> {
        self.control
            .send(command)
            .map_err(|_| anyhow!("the SLAM worker has already stopped"))
    }

    /// Waits for the run to end. Returns the summary and the number of broadcasts.
    pub fn join(self) -> anyhow::Result<(RunSummary, usize)> {
        let summary = self
            .worker
            .join()
            .map_err(|_| anyhow!("the SLAM worker panicked"))??;
        let broadcasts = self
            .broadcaster
            .join()
            .map_err(|_| anyhow!("the broadcaster panicked"))?;
        Ok((summary, broadcasts))
    }
}

fn broadcast_loop(snapshot: &EstimateSnapshot, period: Duration, done: &Receiver<()>) -> usize {
    let ticker = channel::tick(period);
    let mut broadcasts = 0;
    loop {
        select! {
            recv(ticker) -> _ => {
                let latest = snapshot.read().clone();
                match latest {
                    Some(estimate) => {
                        let p = estimate.pose.translation.vector;
                        info!(
                            "[pose] t={:.1} x={:.2} y={:.2} z={:.2} σxy={:.3}",
                            estimate.timestamp,
                            p.x,
                            p.y,
                            p.z,
                            (estimate.covariance[(0, 0)] + estimate.covariance[(1, 1)]).sqrt()
                        );
                        broadcasts += 1;
                    }
                    None => warn!("No estimate to broadcast yet"),
                }
            }
            recv(done) -> _ => break,
        }
    }
    broadcasts
}
