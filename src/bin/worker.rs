//! `fightsim-worker`: one long-lived process per `docker run`, owning
//! exactly one forkserver container for its whole lifetime (spec.md
//! §4.F; grounded on the module-level `fs_container`/`fs_pid`/`tracer`
//! setup at the top of `simulator/entry.py`, which all happen once,
//! before the request loop, not per fight). Pulls fight requests off
//! the request stream, runs them, and publishes results.

use fightsim::config::WorkerContext;
use fightsim::container::ForkserverContainer;
use fightsim::forkserver::ForkServerLink;
use fightsim::orchestrator;
use fightsim::queue::QueueClient;
use fightsim::tracer::Tracer;
use std::cell::RefCell;
use std::rc::Rc;
use structopt::StructOpt;
use tracing::{error, info, warn};

/// Matches the original's `WORKER_NAME = sys.argv[1]`: the single
/// required argument, used both as the Redis consumer name and as the
/// log prefix.
#[derive(StructOpt)]
#[structopt(name = "fightsim-worker")]
struct Opt {
    worker_name: String,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let opt = Opt::from_args();
    let ctx = WorkerContext::load(opt.worker_name.clone())?;
    info!(worker = %ctx.worker_name, "starting worker");
    info!(games = ?fightsim::games::GAME_NAMES, "registered game referees");

    let container = ForkserverContainer::start(&ctx.global)?;
    info!(container_id = container.id(), "forkserver container started");

    let host_pid = container.host_pid()?;
    info!(pid = host_pid.as_raw(), "forkserver pid discovered");

    let mut tracer = Tracer::new();
    let forkserver = ForkServerLink::attach(&mut tracer, host_pid, ctx.forkserver_fds())?;

    let tracer = Rc::new(RefCell::new(tracer));
    let forkserver = Rc::new(RefCell::new(forkserver));

    let mut queue = QueueClient::connect(&ctx.global, &ctx.worker_name)?;

    for delivery in queue.claim_unacked()? {
        process_one(&ctx, Rc::clone(&tracer), Rc::clone(&forkserver), &mut queue, delivery);
    }

    loop {
        let delivery = match queue.next_request() {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "failed to read next fight request");
                continue;
            }
        };
        process_one(&ctx, Rc::clone(&tracer), Rc::clone(&forkserver), &mut queue, delivery);
    }
}

fn process_one(
    ctx: &WorkerContext,
    tracer: Rc<RefCell<Tracer>>,
    forkserver: Rc<RefCell<ForkServerLink>>,
    queue: &mut QueueClient,
    delivery: fightsim::queue::Delivery,
) {
    info!(fight_id = %delivery.request.fight_id, game = %delivery.request.game_name, "running fight");
    match orchestrator::run_fight(ctx, tracer, forkserver, &delivery.request) {
        Ok(result) => {
            if let Err(e) = queue.publish_result(&delivery, &result) {
                error!(error = %e, "failed to publish fight result");
            }
        }
        Err(e) => {
            warn!(error = %e, "fight failed to run to completion; leaving request unacked");
        }
    }
}
