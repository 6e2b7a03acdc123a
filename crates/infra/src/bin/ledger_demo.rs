//! Walks an in-memory ledger through a purchase, a stalled pledge, its
//! completion and a refund while a background executor runs the side effects
//! as they fall due.
//!
//! With `PLEDGEBANK_DATABASE_URL` set it also claims a coupon code from
//! Postgres.

use std::sync::Arc;

use anyhow::Context;

use pledgebank_core::HolderId;
use pledgebank_events::{EventEnvelope, InMemoryEventBus};
use pledgebank_infra::collaborators::{CardDetails, LoggingNotifier, SandboxPaymentGateway};
use pledgebank_infra::coupons::{AsyncCouponPool, PostgresCouponPool};
use pledgebank_infra::jobs::{InMemoryJobStore, JobExecutor, JobExecutorConfig, JobStore};
use pledgebank_infra::side_effects::register_handlers;
use pledgebank_infra::store::InMemoryLedgerStore;
use pledgebank_infra::{CreditLedger, EngineConfig, NewMovement};
use pledgebank_ledger::{Actor, Holder, LedgerEvent};

const DATABASE_URL: &str = "PLEDGEBANK_DATABASE_URL";

fn main() -> anyhow::Result<()> {
    pledgebank_observability::init();

    let config = EngineConfig::from_env();
    let poll_interval = config.executor_poll_interval();
    let store = InMemoryLedgerStore::arc();
    let jobs = InMemoryJobStore::arc();
    let bus: Arc<InMemoryEventBus<EventEnvelope<LedgerEvent>>> = Arc::new(InMemoryEventBus::new());
    let ledger = CreditLedger::new(store.clone(), jobs.clone(), bus, config)
        .with_payment_gateway(Arc::new(SandboxPaymentGateway::new()));

    let mut executor = JobExecutor::new(jobs.clone());
    register_handlers(&mut executor, Arc::new(LoggingNotifier), store);
    let executor = executor
        .spawn(JobExecutorConfig::default().with_poll_interval(poll_interval))
        .context("failed to start the job executor")?;

    let backer = HolderId::new();
    let user = Holder::user(backer);
    let project = Holder::project(HolderId::new());

    let card = CardDetails {
        first_name: "Ada".to_string(),
        last_name: "Lovelace".to_string(),
        number: "4111 1111 1111 1111".to_string(),
        ccv: "123".to_string(),
        expire_month: 6,
        expire_year: 2030,
        country: "GB".to_string(),
    };
    let purchase = ledger.purchase_credits(backer, 100, card)?;
    tracing::info!(approved = purchase.is_approved(), "credits purchased");

    let pledge = ledger.create(NewMovement::new(user, project, 150).comments("first pledge"))?;
    tracing::info!(state = pledge.state().as_str(), "pledge recorded");

    ledger.create(NewMovement::new(Holder::adjustment(HolderId::new()), user, 50))?;
    let pledge = ledger
        .movement(pledge.id_typed())?
        .context("pledge disappeared")?;
    tracing::info!(
        state = pledge.state().as_str(),
        backer_balance = ledger.current_balance(&user)?,
        project_balance = ledger.current_balance(&project)?,
        "after top-up"
    );

    let refund = ledger.refund(pledge.id_typed(), &Actor::new(HolderId::new(), "Support"))?;
    tracing::info!(refund_id = %refund.id_typed(), comments = refund.comments(), "pledge refunded");

    // Give the executor a few ticks to pick up what is already due.
    std::thread::sleep(poll_interval * 3);
    let stats = executor.stats();
    executor.shutdown();
    let still_delayed = jobs.stats()?.pending;
    tracing::info!(
        processed = stats.jobs_processed,
        succeeded = stats.jobs_succeeded,
        still_delayed,
        "side effects executed"
    );

    if let Ok(url) = std::env::var(DATABASE_URL) {
        claim_coupon(&url)?;
    }
    Ok(())
}

fn claim_coupon(url: &str) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let pool = sqlx::PgPool::connect(url)
            .await
            .context("failed to connect to Postgres")?;
        let coupons = PostgresCouponPool::new(pool);
        coupons.migrate().await?;

        let campaign = format!("DEMO-{}", uuid::Uuid::now_v7());
        let coupon = coupons.create_coupon(&campaign, None).await?;
        coupons
            .provision_codes(coupon.id(), &[format!("{campaign}-1"), format!("{campaign}-2")])
            .await?;

        let code = coupons.allocate(coupon.id(), None).await?;
        let remaining = coupons.remaining(coupon.id()).await?;
        tracing::info!(campaign = %campaign, code = %code, remaining, "coupon claimed");
        Ok::<_, anyhow::Error>(())
    })
}
