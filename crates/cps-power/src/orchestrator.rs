//! Simulation orchestrator: drives `nsim` (generate, fit) iterations.
//!
//! Iteration `i` always generates from `run_seed + i` (wrapping), so the set
//! of results does not depend on the execution mode. In pooled mode results
//! arrive out of order; they are parked in an index-addressed buffer and fed
//! to the [`Monitor`] strictly in index order, which makes the pooled report
//! identical to the sequential one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use cps_core::{
    Error, ModelComparisonService, ModelFitResult, ModelFittingService, Result, SimulatedDataset,
    TrialDesign,
};

use crate::aggregate::{self, effective_adjustment};
use crate::config::PowerConfig;
use crate::generator::Generator;
use crate::monitor::{Monitor, project_run_time};
use crate::report::{PowerReport, RawRunData};
use crate::worker::{FitWorker, ModelPlan};

/// One finished iteration.
#[derive(Debug, Clone)]
struct Iteration {
    result: ModelFitResult,
    data: Option<SimulatedDataset>,
}

/// Runs a power simulation for one design and configuration.
pub struct Orchestrator<'a, S: ?Sized> {
    design: &'a TrialDesign,
    config: &'a PowerConfig,
    service: &'a S,
    generator: Generator<'a>,
    worker: FitWorker<'a, S>,
}

impl<'a, S> Orchestrator<'a, S>
where
    S: ModelFittingService + ModelComparisonService + ?Sized,
{
    /// Validate inputs and resolve the model plan.
    pub fn new(design: &'a TrialDesign, config: &'a PowerConfig, service: &'a S) -> Result<Self> {
        config.validate()?;
        let generator = Generator::new(design)?;
        let plan = ModelPlan::new(design.family, config.method);
        let worker = FitWorker::new(service, plan, design.narms);
        Ok(Self { design, config, service, generator, worker })
    }

    fn iteration(&self, index: usize, run_seed: u64) -> Result<Iteration> {
        let data = self.generator.generate(run_seed.wrapping_add(index as u64))?;
        let result = self.worker.fit(index, &data);
        tracing::debug!(
            iteration = index,
            converged = result.converged,
            attempts = result.attempts,
            "iteration complete"
        );
        Ok(Iteration { result, data: self.config.keep_raw_data.then_some(data) })
    }

    /// Execute the run.
    ///
    /// Early stops are not errors: the returned report carries the abort
    /// reason and the partial results. Use [`PowerReport::into_result`] to
    /// turn an aborted report into an error.
    pub fn run(&self) -> Result<PowerReport> {
        let start = Instant::now();
        let cfg = self.config;
        let nsim = cfg.nsim;
        let seed = cfg.seed.unwrap_or_else(rand::random::<u64>);
        let workers = cfg.workers.resolve();

        tracing::info!(
            nsim,
            seed,
            workers,
            family = %self.design.family,
            method = %cfg.method,
            backend = self.service.name(),
            "starting power simulation"
        );

        let mut monitor = Monitor::new(nsim, self.design.alpha, cfg.thresholds, cfg.overrides);

        if !cfg.overrides.time_limit {
            // Warm-up seed sits just below the iteration seeds so it never collides with them.
            let t0 = Instant::now();
            let warm = self.generator.generate(seed.wrapping_sub(1))?;
            let _ = self.worker.fit(usize::MAX, &warm);
            let projected = project_run_time(t0.elapsed(), nsim, workers);
            tracing::debug!(
                warm_up_s = t0.elapsed().as_secs_f64(),
                projected_s = projected.as_secs_f64(),
                "warm-up"
            );
            monitor.check_time_budget(projected);
        }

        let iterations = if monitor.state().is_terminal() {
            Vec::new()
        } else if cfg.workers.is_pooled() {
            self.run_pooled(seed, workers, &mut monitor)?
        } else {
            self.run_sequential(seed, &mut monitor)?
        };

        let (results, datasets): (Vec<ModelFitResult>, Vec<Option<SimulatedDataset>>) =
            iterations.into_iter().map(|it| (it.result, it.data)).unzip();

        let agg = aggregate::aggregate(
            &results,
            self.design.narms,
            cfg.method,
            cfg.adjust,
            self.design.alpha,
        )?;

        let (convergence, raw) = if cfg.keep_raw_data {
            let raw = RawRunData {
                datasets: datasets.into_iter().flatten().collect(),
                converged: results.iter().map(|r| r.converged).collect(),
            };
            (None, Some(raw))
        } else {
            (Some(aggregate::convergence_summary(&results)), None)
        };

        let abort = monitor.abort_reason();
        if let Some(reason) = &abort {
            tracing::warn!(completed = results.len(), nsim, "run halted: {}", reason.to_error());
        }

        let report = PowerReport {
            status: monitor.state(),
            abort,
            nsim_requested: nsim,
            nsim_completed: results.len(),
            seed,
            family: self.design.family,
            method: cfg.method,
            adjust: effective_adjustment(cfg.method, cfg.adjust),
            alpha: self.design.alpha,
            backend: self.service.name().to_string(),
            arm_power: agg.arm_power,
            omnibus_power: agg.omnibus_power,
            icc: aggregate::theoretical_icc(self.design),
            matrices: agg.matrices,
            convergence,
            raw,
            wall_s: start.elapsed().as_secs_f64(),
        };

        tracing::info!(
            status = ?report.status,
            completed = report.nsim_completed,
            omnibus_power = report.omnibus_power.power,
            wall_s = report.wall_s,
            "power simulation finished"
        );
        Ok(report)
    }

    fn run_sequential(&self, seed: u64, monitor: &mut Monitor) -> Result<Vec<Iteration>> {
        let nsim = self.config.nsim;
        let mut out = Vec::with_capacity(nsim);
        for i in 0..nsim {
            let it = self.iteration(i, seed)?;
            let state = monitor.observe(&it.result);
            out.push(it);
            log_progress(out.len(), nsim);
            if state.is_terminal() {
                break;
            }
        }
        Ok(out)
    }

    fn run_pooled(
        &self,
        seed: u64,
        workers: usize,
        monitor: &mut Monitor,
    ) -> Result<Vec<Iteration>> {
        let nsim = self.config.nsim;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| Error::Computation(format!("failed to create thread pool: {e}")))?;

        let stop = AtomicBool::new(false);
        let (tx, rx) = mpsc::channel::<(usize, Result<Iteration>)>();
        let mut buffer: Vec<Option<Iteration>> = (0..nsim).map(|_| None).collect();
        let mut out = Vec::with_capacity(nsim);
        let mut failure: Option<Error> = None;

        std::thread::scope(|scope| {
            let stop = &stop;
            scope.spawn(move || {
                pool.scope(move |s| {
                    for i in 0..nsim {
                        let tx = tx.clone();
                        s.spawn(move |_| {
                            if stop.load(Ordering::Relaxed) {
                                return;
                            }
                            // Receiver outlives every task; a send error cannot happen.
                            let _ = tx.send((i, self.iteration(i, seed)));
                        });
                    }
                });
            });

            // Drains until every task has finished or been skipped.
            let mut next = 0usize;
            for (i, outcome) in rx {
                if stop.load(Ordering::Relaxed) {
                    continue;
                }
                match outcome {
                    Ok(it) => buffer[i] = Some(it),
                    Err(e) => {
                        failure = Some(e);
                        stop.store(true, Ordering::Relaxed);
                        continue;
                    }
                }
                while let Some(it) = buffer.get_mut(next).and_then(Option::take) {
                    let state = monitor.observe(&it.result);
                    out.push(it);
                    next += 1;
                    log_progress(next, nsim);
                    if state.is_terminal() {
                        stop.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(out),
        }
    }
}

fn log_progress(completed: usize, nsim: usize) {
    let step = (nsim / 10).max(1);
    if completed % step == 0 || completed == nsim {
        tracing::info!(completed, nsim, "progress");
    }
}

/// Run a power simulation for `design` with `service` as the fitting backend.
pub fn run_power<S>(design: &TrialDesign, config: &PowerConfig, service: &S) -> Result<PowerReport>
where
    S: ModelFittingService + ModelComparisonService + ?Sized,
{
    Orchestrator::new(design, config, service)?.run()
}
