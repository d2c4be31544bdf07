//! The pipeline driver: strictly sequenced phases, with bounded parallelism
//! only inside the two hashing passes.
//!
//! load -> seed -> search -> overshadow -> hash -> build -> generate ->
//! write -> reconcile. Search, build, and generate are fail-continue; every
//! failure is recorded and surfaces in the exit status. Job loading is
//! fail-fast.

use std::collections::HashSet;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use crate::builder::Builder;
use crate::config::PipelineConfig;
use crate::database::{DatabaseManifest, DatabaseResult};
use crate::generator::Generator;
use crate::item::{self, Item, ItemStore, SourceRef};
use crate::job::JobFile;
use crate::manifest::{Manifest, ManifestResult, ResultKind};
use crate::paths;
use crate::searcher::{SearchEngine, Searcher};

fn progress(len: u64, msg: &'static str, hide: bool) -> ProgressBar {
    if hide {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(len);
    bar.set_style(
        ProgressStyle::with_template("[{percent:>3}%] {msg}: {wide_bar} {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.set_message(msg);
    bar
}

/// Run the whole pipeline. `Ok(true)` is a fully clean run, `Ok(false)` a
/// run with recorded asset failures or a reconciler refusal; `Err` is fatal
/// (bad job file, unknown plugin, unwritable manifest).
pub fn run(config: &PipelineConfig) -> Result<bool> {
    let mut clean = true;

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.threads)
        .build()
        .context("failed to build hash thread pool")?;

    // ── Prior manifest and shared database ───────────────────────────────
    let mut old_manifest = Manifest::default();
    if let Some(manifest_in) = &config.manifest_input {
        match Manifest::load(manifest_in) {
            Ok(m) => old_manifest = m,
            Err(e) => warn!("ignoring unreadable prior manifest: {e:#}"),
        }
        info!(
            "calculating hashes of previously built files... [{}]",
            config.threads
        );
        old_manifest.precalculate_dest_hashes(&config.output_dir, config.hash_mode, &pool);
    }

    let mut database = DatabaseManifest::default();
    if config.load_from_database || config.save_to_database {
        if let Some(db_path) = config.database_manifest_path() {
            database = DatabaseManifest::load_or_default(&db_path);
        }
    }

    // ── Job description (fail-fast) ──────────────────────────────────────
    let job = JobFile::load(&config.job_file)?;

    // The job file's Inputs section names the ordered roots, resolved
    // against the CLI input dir; a job without one uses the CLI dir itself.
    let input_roots: Vec<std::path::PathBuf> = if job.inputs.is_empty() {
        config.input_dirs.clone()
    } else {
        let base = &config.input_dirs[0];
        job.inputs
            .iter()
            .map(|p| {
                if p == "." {
                    return base.clone();
                }
                let p = std::path::Path::new(p);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    base.join(p)
                }
            })
            .collect()
    };

    info!("adding searchers...");
    let searchers: Vec<Searcher> = job
        .searchers
        .iter()
        .map(Searcher::from_entry)
        .collect::<Result<_, _>>()?;

    info!("adding builders...");
    let builders: Vec<Builder> = job
        .builders
        .iter()
        .map(Builder::from_entry)
        .collect::<Result<_, _>>()?;

    info!("adding generators...");
    let generators: Vec<Generator> = job
        .generators
        .iter()
        .map(Generator::from_entry)
        .collect::<Result<_, _>>()?;

    // ── Seed items ───────────────────────────────────────────────────────
    info!("adding items...");
    let mut store = ItemStore::default();
    let bar = progress(job.items.len() as u64, "seeding", config.hide_progress);
    for job_item in &job.items {
        expand_seed(&input_roots, job_item, &mut store);
        bar.inc(1);
    }
    bar.finish_and_clear();

    if config.print_item_list {
        info!("printing item list from job file...");
        for it in store.seeds() {
            info!("{it}");
        }
    }

    // ── Recursive search ─────────────────────────────────────────────────
    info!("running searchers through items...");
    let mut engine = SearchEngine::new(&searchers);
    engine.run(&mut store);
    info!(
        "found a total of {} objects when searching",
        store.found_count()
    );
    let mut items = store.into_working_list();

    info!("marking overshadowed items");
    item::mark_overshadowed(&mut items);

    if config.print_duplicates {
        info!("looking for duplicate items...");
        let rows = item::report_duplicates(&items, config.report_cross_lineage_duplicates);
        // Line-number list of removable job-file references, machine
        // readable for tooling.
        for src in rows {
            eprintln!("RMLN:{}", src.row);
        }
    }

    if config.print_missing {
        info!("printing files in folder but not in deploy list...");
        let known: HashSet<&str> = items.iter().map(|i| i.path()).collect();
        for input in &input_roots {
            for rel in paths::list_files(input) {
                if !known.contains(rel.as_str()) {
                    println!("{rel}");
                }
            }
        }
    }

    // ── Hashing (parallel, disjoint slots) ───────────────────────────────
    info!("calculating item hashes... [{}]", config.threads);
    let mode = config.hash_mode;
    pool.install(|| {
        items.par_iter_mut().for_each(|i| i.calculate_hash(mode));
    });

    if !config.mute_missing {
        info!("listing referenced items missing from disk...");
        for it in items.iter().filter(|i| i.hash.is_empty() && !i.is_overshadowed()) {
            error!("missing item {it}");
        }
    }

    // ── Build ────────────────────────────────────────────────────────────
    let mut result_manifest = Manifest::default();
    info!("running builders through items...");
    let bar = progress(items.len() as u64, "building", config.hide_progress);
    let mut type_builder_counts: std::collections::HashMap<String, usize> =
        std::collections::HashMap::new();
    for it in &items {
        bar.inc(1);
        if it.is_overshadowed() {
            info!("skipping {it} because it's overshadowed");
            continue;
        }
        if it.is_search_only() {
            debug!("skipping {it} because it's search only");
            continue;
        }

        let mut count = 0usize;
        for builder in &builders {
            if !builder.matches(it) {
                debug!("skipping {} on {it}, doesn't match pattern", builder.name);
                continue;
            }
            count += 1;
            if !build_one(config, it, builder, &old_manifest, &database, &mut result_manifest) {
                clean = false;
            }
        }

        if count == 0 && !it.hash.is_empty() {
            warn!("{it} has no assigned builder");
        }
        let entry = type_builder_counts.entry(it.type_tag.clone()).or_insert(0);
        *entry = (*entry).max(count);
    }
    bar.finish_and_clear();

    info!("checking what item types don't have a builder...");
    for (type_tag, count) in &type_builder_counts {
        if *count == 0 {
            warn!("item type \"{type_tag}\" has no assigned builder");
        }
    }

    // ── Generators: snapshot of builder-phase results only ───────────────
    info!("running generators...");
    let snapshot: Vec<ManifestResult> = result_manifest.results().to_vec();
    for generator in &generators {
        debug!("running {}", generator.name);
        let outcome = generator.run(&config.output_dir, &snapshot);
        result_manifest.add_result(ManifestResult::generated(
            &config.output_dir,
            outcome.dest,
            outcome.success,
            &generator.name,
            &generator.version,
            &outcome.type_tag,
            mode,
        ));
    }

    if result_manifest.has_error() {
        error!("some builder(s) caused an error, see manifest for more info");
        clean = false;
    }

    // ── Reconcile: unlink nothing unless the output dir is fully accounted
    // for ────────────────────────────────────────────────────────────────
    if clean || config.force_removes {
        if !reconcile(config, &old_manifest, &result_manifest) {
            clean = false;
        }
    } else {
        error!("skipping removal due to previous error(s)");
    }

    // ── Temporary extracted inputs ───────────────────────────────────────
    info!("removing temporary items...");
    for it in items.iter().filter(|i| i.is_delete_on_exit()) {
        if config.perform_removes {
            debug!("removing {it}");
            let path = it.abs_path();
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove temporary {}: {e}", path.display());
            }
        } else {
            debug!("skipping remove of {it} as --perform-removes isn't specified");
        }
    }

    // ── Manifest and database write-back ─────────────────────────────────
    if let Some(manifest_out) = &config.manifest_output {
        info!("saving resulting manifest to disk: {}", manifest_out.display());
        result_manifest.save(manifest_out)?;
    }

    if config.save_to_database && config.database_dir.is_some() {
        save_to_database(config, &builders, &result_manifest, &mut database)?;
    }

    Ok(clean)
}

/// Resolve one job-file item declaration against the input roots, with
/// case-correction fallback, and seed the store. Recursive declarations
/// admit every file under the rooted subtree whose path ends with the
/// declared suffix.
fn expand_seed(
    input_roots: &[std::path::PathBuf],
    job_item: &crate::job::JobItem,
    store: &mut ItemStore,
) {
    let source = SourceRef {
        path: paths::normalize_rel(&job_item.path),
        type_tag: job_item.type_tag.clone(),
        row: job_item.row,
    };

    debug!("loading transfer: {}", job_item.path);
    let mut chosen: Option<(std::path::PathBuf, String)> = None;
    for input in input_roots {
        let candidate = paths::assemble(input, &job_item.path);
        if candidate.exists() {
            chosen = Some((input.clone(), job_item.path.clone()));
            break;
        }
        if let Some(corrected) = paths::case_correct(&candidate) {
            if let Ok(rel) = paths::relative_to(&corrected, input) {
                warn!(
                    "path \"{}\" for item had to be case corrected to {rel}. Row: {}",
                    job_item.path, job_item.row
                );
                chosen = Some((input.clone(), rel));
                break;
            }
        }
    }

    let Some((input, rel)) = chosen else {
        error!(
            "path \"{}\" for item is invalid, even after case correction. Row: {}",
            job_item.path, job_item.row
        );
        return;
    };

    if job_item.recursive {
        debug!("transfer is recursive");
        let subtree_root = paths::assemble(&input, &rel);
        let files = paths::list_files(&subtree_root);
        debug!("loaded from {} found {} files", subtree_root.display(), files.len());
        for sub in files {
            let full_sub_path = if rel.is_empty() {
                sub.clone()
            } else {
                format!("{}/{}", rel.trim_end_matches('/'), sub)
            };
            if full_sub_path.ends_with(&job_item.path_ending) {
                debug!("including {full_sub_path}");
                store.add_seed(Item::new(
                    &input,
                    &full_sub_path,
                    &job_item.type_tag,
                    source.clone(),
                ));
            } else {
                debug!("ignoring {full_sub_path}");
            }
        }
    } else {
        let mut it = Item::new(&input, &rel, &job_item.type_tag, source);
        it.overshadows = job_item
            .overshadows
            .as_deref()
            .map(paths::normalize_rel);
        store.add_seed(it);
    }
}

/// Build (or reuse) one `(item, builder)` pair. Returns false when this pair
/// made the run dirty.
fn build_one(
    config: &PipelineConfig,
    it: &Item,
    builder: &Builder,
    old_manifest: &Manifest,
    database: &DatabaseManifest,
    result_manifest: &mut Manifest,
) -> bool {
    let mode = config.hash_mode;

    // 1. Verbatim reuse from the prior manifest.
    if !builder.run_even_on_identical_source()
        && old_manifest.is_up_to_date(it, builder, &config.output_dir, mode)
    {
        if let Some(prev) = old_manifest.previously_built_result(it, builder) {
            debug!("using cached result on {it}");
            result_manifest.add_result(prev);
            return true;
        }
    }

    // 2. Restore from the shared database.
    if config.load_from_database
        && !builder.run_even_on_identical_source()
        && builder.store_result_in_database()
    {
        if let Some(db_dir) = &config.database_dir {
            if database.has_built_result_for(it, builder, db_dir, mode) {
                if let Some(dmr) = database.previously_built_result(it, builder) {
                    info!("using database value on {it}");
                    let payload = paths::assemble(db_dir, &dmr.payload_rel());
                    let dest_abs = paths::assemble(&config.output_dir, &dmr.dest);
                    match paths::copy_creating_dirs(&payload, &dest_abs) {
                        Ok(()) => {
                            result_manifest.add_result(ManifestResult::from_database(
                                dmr.dest_hash.clone(),
                                it.clone(),
                                dmr.dest.clone(),
                                &dmr.name,
                                &dmr.version,
                                &dmr.type_tag,
                            ));
                            return true;
                        }
                        Err(e) => {
                            warn!("database restore failed for {it}, rebuilding: {e}");
                        }
                    }
                }
            }
        }
    }

    // 3. Fresh build. A missing source (empty hash) skips the builder and
    // fails the run.
    if it.hash.is_empty() {
        error!("unable to run {} on {it}, file missing", builder.name);
        return false;
    }
    debug!("running {} on {it}", builder.name);
    let outcome = builder.run(&config.output_dir, it);
    let success = outcome.success;
    result_manifest.add_result(ManifestResult::built(
        &config.output_dir,
        it.clone(),
        outcome.dest,
        outcome.success,
        &builder.name,
        &builder.version,
        &it.type_tag,
        mode,
    ));
    success
}

/// Unlisted-file removal with the safety interlock: unless every unlisted
/// file is covered by the remove list (or removal is forced), nothing is
/// deleted and the run fails: divergence in a fully managed directory is a
/// bug.
fn reconcile(config: &PipelineConfig, old_manifest: &Manifest, new_manifest: &Manifest) -> bool {
    info!("removing items not listed in the generated manifest");

    let destination_files = paths::list_files(&config.output_dir);
    let new_files: HashSet<String> = new_manifest.destination_files().into_iter().collect();
    let old_files: HashSet<String> = old_manifest.destination_files().into_iter().collect();

    let unlisted: Vec<String> = destination_files
        .into_iter()
        .filter(|f| !new_files.contains(f))
        .collect();
    for f in &unlisted {
        info!("unlisted: {f}");
    }

    let remove_list: Vec<String> = if config.remove_unlisted {
        info!("adding all unlisted files into the remove list. (--remove-unlisted)");
        unlisted.clone()
    } else {
        // Only remove unlisted files known to a previous run of this
        // pipeline.
        unlisted
            .iter()
            .filter(|f| old_files.contains(*f))
            .cloned()
            .collect()
    };

    if remove_list != unlisted && !config.force_removes {
        error!(
            "unlisted files and old manifest files don't match; refusing to remove anything \
             because this is a hint that something isn't right in this fully managed directory"
        );
        return false;
    }

    if remove_list == unlisted {
        info!("unlisted files match old manifest, removing them");
    } else {
        info!("dictated to forcefully remove all found items");
    }

    for rel in &remove_list {
        let full = paths::assemble(&config.output_dir, rel);
        if config.perform_removes {
            warn!("removing {}", full.display());
            if let Err(e) = std::fs::remove_file(&full) {
                warn!("failed to remove {}: {e}", full.display());
            }
        } else {
            info!("pretending to remove (no --perform-removes): {}", full.display());
        }
    }
    true
}

/// Copy every fresh, database-eligible BUILT result into the shared store
/// and persist the database manifest.
fn save_to_database(
    config: &PipelineConfig,
    builders: &[Builder],
    result_manifest: &Manifest,
    database: &mut DatabaseManifest,
) -> Result<()> {
    let Some(db_dir) = config.database_dir.as_ref() else {
        return Ok(());
    };

    for r in result_manifest.results() {
        if r.kind != ResultKind::Built || !r.success {
            continue;
        }
        if r.items.len() != 1 {
            warn!("database doesn't support multi item sources");
            continue;
        }
        let stores = builders
            .iter()
            .find(|b| b.name == r.name)
            .map(|b| b.store_result_in_database())
            .unwrap_or(false);
        if !stores {
            continue;
        }
        // Skip records the database already carries for this exact key.
        let already = database
            .results()
            .iter()
            .any(|d| d.item == r.items[0] && d.name == r.name && d.version == r.version);
        if already {
            continue;
        }

        info!("storing {} in database for future use", r.dest);
        let source = paths::assemble(&config.output_dir, &r.dest);
        let dest = db_dir
            .join("files")
            .join(&r.items[0].hash)
            .join(&r.dest_hash);
        paths::copy_creating_dirs(&source, &dest)?;

        database.add_result(DatabaseResult {
            item: r.items[0].clone(),
            dest: r.dest.clone(),
            dest_hash: r.dest_hash.clone(),
            name: r.name.clone(),
            version: r.version.clone(),
            type_tag: r.type_tag.clone(),
        });
    }

    let db_path = db_dir.join("database_manifest.xml");
    paths::create_parent_dirs(&db_path)?;
    database.save(&db_path)
}
