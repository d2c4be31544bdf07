//! End-to-end pipeline scenarios against real temp directories: clean
//! build, incremental no-op, source-edit rebuild, reconciler safety, shared
//! database reuse, and overshadowing.

use std::fs;
use std::path::PathBuf;

use ogda::config::PipelineConfig;
use ogda::hash::HashMode;
use ogda::pipeline;
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    input: PathBuf,
    output: PathBuf,
    scratch: PathBuf,
}

impl Fixture {
    fn new(job_xml: &str) -> Self {
        let root = TempDir::new().unwrap();
        let input = root.path().join("input");
        let output = root.path().join("output");
        let scratch = root.path().join("scratch");
        fs::create_dir_all(input.join("Meshes")).unwrap();
        fs::create_dir_all(&output).unwrap();
        fs::create_dir_all(&scratch).unwrap();
        fs::write(scratch.join("job.xml"), job_xml).unwrap();
        Self {
            _root: root,
            input,
            output,
            scratch,
        }
    }

    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            input_dirs: vec![self.input.clone()],
            output_dir: self.output.clone(),
            job_file: self.scratch.join("job.xml"),
            manifest_input: None,
            manifest_output: Some(self.scratch.join("manifest.xml")),
            database_dir: None,
            threads: 2,
            hash_mode: HashMode::Content,
            perform_removes: false,
            force_removes: false,
            remove_unlisted: false,
            load_from_database: false,
            save_to_database: false,
            print_missing: false,
            print_duplicates: false,
            print_item_list: false,
            mute_missing: true,
            hide_progress: true,
            report_cross_lineage_duplicates: false,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.scratch.join("manifest.xml")
    }

    fn manifest_text(&self) -> String {
        fs::read_to_string(self.manifest_path()).unwrap()
    }
}

const COPY_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="."/>
  </Inputs>
  <Items>
    <Item path="Meshes/cube.obj" type="mesh"/>
  </Items>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh"/>
  </Builders>
</Job>
"#;

const RECURSIVE_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="."/>
  </Inputs>
  <Items>
    <Item path="Meshes" type="mesh" recursive="true" path_ending=".obj"/>
  </Items>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh"/>
  </Builders>
</Job>
"#;

fn cube_bytes() -> &'static [u8] {
    b"v 0 0 0\nv 1 0 0\nv 0 1 0\nf 1 2 3\n"
}

#[test]
fn clean_build_copies_and_records_one_built_result() {
    let fx = Fixture::new(COPY_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();

    let clean = pipeline::run(&fx.config()).unwrap();
    assert!(clean);
    assert_eq!(
        fs::read(fx.output.join("Meshes/cube.obj")).unwrap(),
        cube_bytes()
    );

    let text = fx.manifest_text();
    assert_eq!(text.matches("<BuilderResult").count(), 1);
    assert!(text.contains("dest=\"Meshes/cube.obj\""));
    assert!(text.contains("fresh_built=\"true\""));
    assert!(text.contains("builder=\"copy\""));
}

#[test]
fn incremental_rerun_reuses_prior_result_verbatim() {
    let fx = Fixture::new(COPY_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();

    assert!(pipeline::run(&fx.config()).unwrap());
    let first = fx.manifest_text();

    let mut cfg = fx.config();
    cfg.manifest_input = Some(fx.manifest_path());
    assert!(pipeline::run(&cfg).unwrap());
    let second = fx.manifest_text();

    // The record was reused, not rebuilt.
    assert!(second.contains("fresh_built=\"false\""));

    // Same source hash and destination hash as the first run.
    let pick = |text: &str, attr: &str| {
        let needle = format!("{attr}=\"");
        let start = text.find(&needle).unwrap() + needle.len();
        text[start..].split('"').next().unwrap().to_string()
    };
    assert_eq!(pick(&first, "dest_hash"), pick(&second, "dest_hash"));
    assert_eq!(pick(&first, " hash"), pick(&second, " hash"));
}

#[test]
fn source_edit_forces_rebuild_with_new_hash() {
    let fx = Fixture::new(COPY_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    assert!(pipeline::run(&fx.config()).unwrap());
    let first = fx.manifest_text();

    // Flip a byte in the source.
    let mut bytes = cube_bytes().to_vec();
    bytes[0] = b'#';
    fs::write(fx.input.join("Meshes/cube.obj"), &bytes).unwrap();

    let mut cfg = fx.config();
    cfg.manifest_input = Some(fx.manifest_path());
    assert!(pipeline::run(&cfg).unwrap());
    let second = fx.manifest_text();

    assert!(second.contains("fresh_built=\"true\""));
    let pick = |text: &str, attr: &str| {
        let needle = format!("{attr}=\"");
        let start = text.find(&needle).unwrap() + needle.len();
        text[start..].split('"').next().unwrap().to_string()
    };
    assert_ne!(pick(&first, " hash"), pick(&second, " hash"));
}

#[test]
fn reconciler_refuses_to_touch_files_it_never_built() {
    let fx = Fixture::new(COPY_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    assert!(pipeline::run(&fx.config()).unwrap());

    // A stranger appears in the fully managed output directory.
    fs::write(fx.output.join("Meshes/stale.mesh"), b"who put this here").unwrap();

    let mut cfg = fx.config();
    cfg.manifest_input = Some(fx.manifest_path());
    cfg.perform_removes = true;
    let clean = pipeline::run(&cfg).unwrap();

    assert!(!clean, "reconciler divergence must fail the run");
    assert!(fx.output.join("Meshes/stale.mesh").exists());
}

#[test]
fn reconciler_removes_files_it_previously_built() {
    let fx = Fixture::new(RECURSIVE_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    fs::write(fx.input.join("Meshes/extra.obj"), b"v 0 0 0\n").unwrap();
    assert!(pipeline::run(&fx.config()).unwrap());
    assert!(fx.output.join("Meshes/extra.obj").exists());

    // Source goes away; the output copy is now unlisted but known to the
    // prior manifest.
    fs::remove_file(fx.input.join("Meshes/extra.obj")).unwrap();

    let mut cfg = fx.config();
    cfg.manifest_input = Some(fx.manifest_path());
    cfg.perform_removes = true;
    assert!(pipeline::run(&cfg).unwrap());
    assert!(!fx.output.join("Meshes/extra.obj").exists());
    assert!(fx.output.join("Meshes/cube.obj").exists());
}

#[test]
fn dry_run_reports_but_keeps_removable_files() {
    let fx = Fixture::new(RECURSIVE_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    fs::write(fx.input.join("Meshes/extra.obj"), b"v 0 0 0\n").unwrap();
    assert!(pipeline::run(&fx.config()).unwrap());
    fs::remove_file(fx.input.join("Meshes/extra.obj")).unwrap();

    let mut cfg = fx.config();
    cfg.manifest_input = Some(fx.manifest_path());
    // No --perform-removes: intended deletes are logged only.
    assert!(pipeline::run(&cfg).unwrap());
    assert!(fx.output.join("Meshes/extra.obj").exists());
}

#[test]
fn shared_database_restores_byte_identical_outputs() {
    let fx1 = Fixture::new(COPY_JOB);
    fs::write(fx1.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    let db_root = TempDir::new().unwrap();

    let mut cfg1 = fx1.config();
    cfg1.database_dir = Some(db_root.path().to_path_buf());
    cfg1.save_to_database = true;
    assert!(pipeline::run(&cfg1).unwrap());
    assert!(db_root.path().join("database_manifest.xml").exists());

    // A second, separate output directory fed from the shared store.
    let fx2 = Fixture::new(COPY_JOB);
    fs::write(fx2.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    let mut cfg2 = fx2.config();
    cfg2.database_dir = Some(db_root.path().to_path_buf());
    cfg2.load_from_database = true;
    assert!(pipeline::run(&cfg2).unwrap());

    assert_eq!(
        fs::read(fx1.output.join("Meshes/cube.obj")).unwrap(),
        fs::read(fx2.output.join("Meshes/cube.obj")).unwrap()
    );
    // The second run restored rather than rebuilt.
    let text = fx2.manifest_text();
    assert_eq!(text.matches("<DatabaseResult").count(), 1);
    assert_eq!(text.matches("<BuilderResult").count(), 0);
}

#[test]
fn overshadowed_items_are_never_built() {
    const OVERSHADOW_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="."/>
  </Inputs>
  <Items>
    <Item path="Meshes/base.obj" type="mesh"/>
    <Item path="Meshes/mod.obj" type="mesh" overshadows="Meshes/base.obj"/>
  </Items>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh"/>
  </Builders>
</Job>
"#;
    let fx = Fixture::new(OVERSHADOW_JOB);
    fs::write(fx.input.join("Meshes/base.obj"), b"v 0 0 0\n").unwrap();
    fs::write(fx.input.join("Meshes/mod.obj"), b"v 1 1 1\n").unwrap();

    assert!(pipeline::run(&fx.config()).unwrap());
    assert!(fx.output.join("Meshes/mod.obj").exists());
    assert!(!fx.output.join("Meshes/base.obj").exists());
    assert_eq!(fx.manifest_text().matches("<BuilderResult").count(), 1);
}

#[test]
fn searchers_pull_in_companion_files() {
    const SEARCH_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="."/>
  </Inputs>
  <Items>
    <Item path="Meshes/rock.obj" type="mesh"/>
  </Items>
  <Searchers>
    <Searcher searcher="obj_hull" path_ending=".obj" type_pattern_re="mesh"/>
  </Searchers>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh|model_hull"/>
  </Builders>
</Job>
"#;
    let fx = Fixture::new(SEARCH_JOB);
    fs::write(fx.input.join("Meshes/rock.obj"), b"v 0 0 0\n").unwrap();
    fs::write(fx.input.join("Meshes/rockHULL.obj"), b"v 0 0 0\n").unwrap();

    assert!(pipeline::run(&fx.config()).unwrap());
    assert!(fx.output.join("Meshes/rockHULL.obj").exists());
    assert_eq!(fx.manifest_text().matches("<BuilderResult").count(), 2);
}

#[test]
fn missing_seed_file_fails_the_run_but_not_the_process() {
    let fx = Fixture::new(COPY_JOB);
    // Meshes/cube.obj never written. Seeding diagnoses it; nothing to
    // build, exit stays clean because no matching builder could even run.
    let clean = pipeline::run(&fx.config()).unwrap();
    assert!(clean);
    assert!(!fx.output.join("Meshes/cube.obj").exists());
}

#[test]
fn generator_runs_on_builder_snapshot() {
    const GEN_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs>
    <Input path="."/>
  </Inputs>
  <Items>
    <Item path="Meshes/cube.obj" type="mesh"/>
  </Items>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh"/>
  </Builders>
  <Generators>
    <Generator generator="item_index"/>
  </Generators>
</Job>
"#;
    let fx = Fixture::new(GEN_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();

    assert!(pipeline::run(&fx.config()).unwrap());
    let index = fs::read_to_string(fx.output.join("index.xml")).unwrap();
    assert!(index.contains("path=\"Meshes/cube.obj\""));
    // The index itself lands in the manifest as a generated result but not
    // in its own listing (snapshot semantics).
    assert!(!index.contains("index.xml"));
    assert!(fx.manifest_text().contains("<GeneratorResult"));
}

#[test]
fn unknown_builder_name_is_a_fatal_config_error() {
    const BAD_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs><Input path="."/></Inputs>
  <Items><Item path="Meshes/cube.obj" type="mesh"/></Items>
  <Builders>
    <Builder builder="does_not_exist" path_ending="" type_pattern_re=".*"/>
  </Builders>
</Job>
"#;
    let fx = Fixture::new(BAD_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();
    assert!(pipeline::run(&fx.config()).is_err());
}

#[test]
fn case_mismatched_seed_path_is_corrected() {
    const WRONG_CASE_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs><Input path="."/></Inputs>
  <Items><Item path="meshes/CUBE.obj" type="mesh"/></Items>
  <Builders>
    <Builder builder="copy" path_ending=".obj" type_pattern_re="mesh"/>
  </Builders>
</Job>
"#;
    let fx = Fixture::new(WRONG_CASE_JOB);
    fs::write(fx.input.join("Meshes/cube.obj"), cube_bytes()).unwrap();

    assert!(pipeline::run(&fx.config()).unwrap());
    assert!(fx.output.join("Meshes/cube.obj").exists());
}

#[test]
fn dangling_reference_fails_the_run() {
    const REF_JOB: &str = r#"<?xml version="1.0"?>
<Job>
  <Inputs><Input path="."/></Inputs>
  <Items><Item path="Levels/arena.xml" type="level"/></Items>
  <Searchers>
    <Searcher searcher="xml_refs" path_ending=".xml" type_pattern_re="level"/>
  </Searchers>
  <Builders>
    <Builder builder="copy" path_ending="" type_pattern_re="level|model"/>
  </Builders>
</Job>
"#;
    let fx = Fixture::new(REF_JOB);
    fs::create_dir_all(fx.input.join("Levels")).unwrap();
    fs::write(
        fx.input.join("Levels/arena.xml"),
        r#"<Level><Object model="Meshes/ghost.obj"/></Level>"#,
    )
    .unwrap();

    // The referenced model does not exist: its hash stays empty, the copy
    // builder matches it, and the run goes dirty without aborting.
    let clean = pipeline::run(&fx.config()).unwrap();
    assert!(!clean);
    assert!(fx.output.join("Levels/arena.xml").exists());
}
