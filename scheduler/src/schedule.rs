use chrono::{NaiveDate, Utc};
use common::{
    config::ScheduleConfig, Interval, RunRecord, Runner, RunnerError, Trigger,
};
use std::{collections::HashSet, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Tope de runs que un tick dispara; el resto del atraso queda para los
/// siguientes ticks.
pub const MAX_TRIGGERS_PER_TICK: usize = 4;

/// Intervalos diarios que tocan ejecutar, del más viejo al más nuevo.
///
/// El último intervalo elegible es ayer (`today - 1`). Sólo cuentan los
/// intervalos sin ningún run registrado: uno fallido no se vuelve a disparar
/// solo, eso queda para `retry` o un trigger manual.
pub fn due_intervals(
    cfg: &ScheduleConfig,
    today: NaiveDate,
    runs: &[RunRecord],
) -> Vec<Interval> {
    let Some(latest) = today.pred_opt().map(Interval) else {
        return Vec::new();
    };
    let start = cfg.start.unwrap_or(latest);
    if start > latest {
        return Vec::new();
    }

    let seen: HashSet<Interval> = runs.iter().map(|r| r.interval).collect();

    if !cfg.catchup {
        return if seen.contains(&latest) {
            Vec::new()
        } else {
            vec![latest]
        };
    }

    let mut out = Vec::new();
    let mut cur = Some(start);
    while let Some(i) = cur {
        if i > latest {
            break;
        }
        if !seen.contains(&i) {
            out.push(i);
        }
        cur = i.next();
    }
    out
}

/// Un tick del scheduler: dispara en segundo plano los intervalos pendientes
/// y devuelve los que arrancó.
pub fn tick(runner: &Arc<Runner>, cfg: &ScheduleConfig, today: NaiveDate) -> Vec<Interval> {
    let runs = match runner.list_runs() {
        Ok(r) => r,
        Err(e) => {
            warn!("schedule: no se pudieron leer los runs: {}", e);
            return Vec::new();
        }
    };

    let mut started = Vec::new();
    for interval in due_intervals(cfg, today, &runs) {
        if started.len() >= MAX_TRIGGERS_PER_TICK {
            debug!("schedule: tope de {} runs por tick alcanzado", MAX_TRIGGERS_PER_TICK);
            break;
        }
        if runner.is_active(&interval) {
            continue;
        }
        match runner.spawn_run(interval, Trigger::Scheduled, false) {
            Ok(_) => {
                info!("schedule: run disparado para {}", interval);
                started.push(interval);
            }
            Err(RunnerError::RunInProgress(_)) => {}
            Err(e) => warn!("schedule: no se pudo disparar {}: {}", interval, e),
        }
    }
    started
}

/// Retoma los runs que quedaron en `running` tras una caída del proceso.
pub fn resume_interrupted(runner: &Arc<Runner>) -> Result<Vec<Interval>, RunnerError> {
    let mut resumed = Vec::new();
    for interval in runner.interrupted_runs()? {
        let trigger = runner
            .status(&interval)?
            .map(|r| r.trigger)
            .unwrap_or(Trigger::Scheduled);
        warn!("run de {} interrumpido, se retoma", interval);
        runner.spawn_run(interval, trigger, false)?;
        resumed.push(interval);
    }
    Ok(resumed)
}

pub async fn schedule_loop(runner: Arc<Runner>, cfg: ScheduleConfig) {
    let period = Duration::from_secs(cfg.tick_secs.max(1));
    info!(
        "schedule activo (tick={}s, catchup={}, start={:?})",
        period.as_secs(),
        cfg.catchup,
        cfg.start.map(|i| i.to_string())
    );

    loop {
        let today = Utc::now().date_naive();
        let started = tick(&runner, &cfg, today);
        if !started.is_empty() {
            debug!("schedule: {} runs disparados en este tick", started.len());
        }
        tokio::time::sleep(period).await;
    }
}
