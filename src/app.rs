//! Wires every subsystem together and owns the shutdown sequence.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::api::RpcState;
use crate::blacklist::Blacklist;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::db::Database;
use crate::downloader::rqbit::RqbitBackend;
use crate::downloader::transmission::TransmissionBackend;
use crate::downloader::{ActiveEpisodes, BackendContext, BackendRegistry, DownloadBackend};
use crate::events::{EventBus, EventKind};
use crate::feeds::aggregate::FeedAggregator;
use crate::feeds::ezrss::EzRssFeeder;
use crate::feeds::publichd::PublicHdFeeder;
use crate::feeds::showrss::ShowRssFeeder;
use crate::feeds::{Feeder, FeederContext, FeederRegistry};
use crate::filer::Filer;
use crate::jobs::backlog::BacklogSearcher;
use crate::jobs::housekeeper::Housekeeper;
use crate::naming::SceneNameParser;
use crate::numbering::NumberingService;
use crate::services::library::{KodiLibrary, LibraryClient, NullLibrary};
use crate::services::metadata::MetadataClient;
use crate::services::notify::LogNotifier;

pub struct App {
    pub config: Arc<Config>,
    pub db: Database,
    pub events: Arc<EventBus>,
    pub catalog: Arc<Catalog>,
    pub metadata: Arc<MetadataClient>,
    pub backends: Arc<BackendRegistry>,
    pub aggregator: Arc<FeedAggregator>,
    pub housekeeper: Arc<Housekeeper>,
    pub backlog: Arc<BacklogSearcher>,
}

impl App {
    pub async fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let events = Arc::new(EventBus::new());
        let blacklist = Arc::new(Blacklist::new());
        let db = Database::connect(&config.database_path).await?;
        let metadata = Arc::new(MetadataClient::new(&config.metadata_base_url));
        let numbering = NumberingService::new(db.clone(), &config.xem_base_url);
        let active = ActiveEpisodes::new();

        let library: Arc<dyn LibraryClient> = match &config.library_url {
            Some(url) => Arc::new(KodiLibrary::new(url)),
            None => {
                info!("no library url configured, running headless");
                Arc::new(NullLibrary)
            }
        };

        let catalog = Arc::new(Catalog::new(
            db.clone(),
            library.clone(),
            metadata.clone(),
            numbering.clone(),
            active.clone(),
            config.new_show_path.clone().into(),
        ));
        let parser = SceneNameParser::new(catalog.clone(), db.clone());
        let filer = Filer::new(
            config.clone(),
            db.clone(),
            library.clone(),
            blacklist.clone(),
            parser.clone(),
            events.clone(),
        );

        let ctx = Arc::new(BackendContext {
            config: config.clone(),
            db: db.clone(),
            blacklist: blacklist.clone(),
            filer,
            active,
            notifier: Arc::new(LogNotifier),
        });
        let backends = BackendRegistry::new(vec![
            RqbitBackend::new(ctx.clone()) as Arc<dyn DownloadBackend>,
            TransmissionBackend::new(ctx.clone()),
        ]);

        let feeder_ctx = FeederContext::new(parser, blacklist.clone(), db.clone());
        let feeders = FeederRegistry::new(vec![
            ShowRssFeeder::new(feeder_ctx.clone()) as Arc<dyn Feeder>,
            EzRssFeeder::new(feeder_ctx.clone()),
            PublicHdFeeder::new(feeder_ctx.clone()),
        ]);

        // Enable-flag changes take effect on the next tick, not the next
        // restart.
        {
            let feeders = feeders.clone();
            events.subscribe(EventKind::SettingsChanged, move || feeders.invalidate());
        }
        {
            let catalog = catalog.clone();
            events.subscribe(EventKind::VideoLibraryUpdated, move || {
                catalog.invalidate_library_cache();
            });
        }

        let aggregator = FeedAggregator::new(
            feeders.clone(),
            catalog.clone(),
            backends.clone(),
            blacklist.clone(),
            db.clone(),
        );
        let housekeeper = Housekeeper::new(
            config.clone(),
            db.clone(),
            blacklist,
            metadata.clone(),
            numbering,
            events.clone(),
        );
        let backlog = BacklogSearcher::new(db.clone(), catalog.clone(), feeders, aggregator.clone());

        Ok(Self {
            config,
            db,
            events,
            catalog,
            metadata,
            backends,
            aggregator,
            housekeeper,
            backlog,
        })
    }

    pub fn rpc_state(&self) -> RpcState {
        RpcState {
            db: self.db.clone(),
            catalog: self.catalog.clone(),
            metadata: self.metadata.clone(),
            backends: self.backends.clone(),
            events: self.events.clone(),
        }
    }

    /// Stop pollers and persist running-download snapshots. Jobs are shut
    /// down by the caller before this runs.
    pub async fn shutdown(&self) {
        self.events.publish(EventKind::AbortRequested);
        self.backends.shutdown_all().await;
        info!("shutdown complete");
    }
}
