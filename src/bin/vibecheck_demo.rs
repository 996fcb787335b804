use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;

use vibecheck::vibecheck::stories::{STORY_TTL_MS, StoryDraft};
use vibecheck::vibecheck::snapshot_source::RecordWriter;
use vibecheck::{
    Backend, Clock, CloudinaryConfig, CloudinaryUploader, MemoryDatabase, Session, SystemClock,
    VibeCheck, VibeCheckConfig, ViewModel, ViewSubscription, ViewUpdate,
};

/// Walks a story-bar subscription through its lifecycle against an
/// in-memory realtime tree.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Directory for application logs
    #[clap(long, value_name = "PATH", default_value = "logs")]
    logs_dir: PathBuf,

    /// Email of the user watching the story bar
    #[clap(long, default_value = "viewer@vibecheck.app")]
    viewer: String,

    /// Email of the user posting stories
    #[clap(long, default_value = "author@vibecheck.app")]
    author: String,

    /// Image to upload through Cloudinary (reads CLOUDINARY_* from the environment)
    #[clap(long, value_name = "FILE")]
    image: Option<PathBuf>,
}

fn print_view(label: &str, view: &ViewModel) {
    println!("--- {label}");
    match &view.own {
        Some(own) => println!("  self:   {} ({} stories)", own.display_name, own.active_records.len()),
        None => println!("  self:   -"),
    }
    for other in &view.others {
        println!(
            "  other:  {} ({} stories, latest {})",
            other.display_name,
            other.active_records.len(),
            other.latest_activity_at
        );
    }
}

fn drain(label: &str, subscription: &mut ViewSubscription<ViewModel>) {
    let mut emitted = false;
    while let Ok(update) = subscription.try_recv() {
        emitted = true;
        match update {
            ViewUpdate::View(view) => print_view(label, &view),
            ViewUpdate::SourceError(error) => println!("--- {label}: source error: {error}"),
        }
    }
    if !emitted {
        println!("--- {label}: no emission");
    }
}

async fn post(app: &VibeCheck, db: &MemoryDatabase, author: &Session, image: Option<&PathBuf>) -> Result<String> {
    if let Some(path) = image {
        let bytes = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
        return Ok(app.post_story(author, bytes, "image/jpeg").await?);
    }
    let now = SystemClock.now_ms();
    let draft = StoryDraft::new(author, format!("https://picsum.photos/seed/{now}/540/960"), now);
    Ok(db.push(&draft.bucket(), draft.to_record()).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let now = SystemClock.now_ms();
    let db = Arc::new(MemoryDatabase::with_data(json!({
        "stories": {
            "seed,user@vibecheck,app": {
                "s1": {
                    "mediaUrl": "https://picsum.photos/seed/old/540/960",
                    "createdAt": now - STORY_TTL_MS,
                    "expiresAt": now - 1,
                },
                "s2": {
                    "mediaUrl": "https://picsum.photos/seed/seed/540/960",
                    "createdAt": now - 60_000,
                    "expiresAt": now - 60_000 + STORY_TTL_MS,
                    "user": {"_id": "seed,user@vibecheck,app", "name": "Seed User"},
                },
            },
        },
    })));

    let mut backend = Backend::in_memory(db.clone());
    if args.image.is_some() {
        backend = backend.with_uploader(Arc::new(CloudinaryUploader::new(CloudinaryConfig::from_env()?)));
    }
    let app = VibeCheck::new(VibeCheckConfig::new(&args.logs_dir), backend)?;

    let viewer = Session::for_email(&args.viewer).with_full_name("Viewer");
    let author = Session::for_email(&args.author).with_full_name("Author");

    let mut bar = app.subscribe_stories(Some(&viewer));
    drain("initial", &mut bar);

    let key = post(&app, &db, &author, args.image.as_ref()).await?;
    tracing::info!(target: "vibecheck_demo::main", "Posted story {}", key);
    drain("after first story", &mut bar);

    let mut anonymous = app.subscribe_stories(None);
    drain("anonymous viewer", &mut anonymous);

    bar.cancel();
    post(&app, &db, &author, None).await?;
    drain("after cancel", &mut bar);

    let mut reopened = app.subscribe_stories(Some(&author));
    drain("author reopens", &mut reopened);
    reopened.cancel();

    Ok(())
}
