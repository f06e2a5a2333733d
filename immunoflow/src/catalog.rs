//! Built-in immunopeptidomics stage catalog.
//!
//! Raw timsTOF acquisitions flow through QC, mzML conversion, database
//! search and rescoring; the rescored PSMs fan out to five predictors whose
//! outputs are merged into the final ranked list:
//!
//! ```text
//! raw_run -> qc -> convert -> search -> rescore -+-> ccs --------+
//!                                                +-> rt ---------+
//!                                                +-> binding ----+-> rank
//!                                                +-> orf --------+
//!                                                +-> similarity -+
//! ```
//!
//! The command templates name the external tools as they are usually
//! installed; a manifest can replace any stage with its own definition.

use crate::contracts::{
    Collaborator, CommandSpec, ConfigSchema, OptionKind, OptionSpec, StageDefinition, StageRegistry,
};
use crate::core::ArtifactType;
use crate::engine::RetryConfig;
use crate::errors::ImmunoflowError;

/// Stage ids in declaration order.
pub const CATALOG_STAGES: [&str; 10] = [
    "qc",
    "convert",
    "search",
    "rescore",
    "ccs",
    "rt",
    "binding",
    "orf",
    "similarity",
    "rank",
];

/// Exit code (`EX_TEMPFAIL`) the prediction wrappers use for retryable
/// failures such as a busy GPU.
pub const TEMPFAIL_EXIT_CODE: i32 = 75;

/// Resource class of GPU-bound predictors.
pub const GPU_RESOURCE: &str = "gpu";

const HOUR: u64 = 60 * 60;

fn command<I, S>(program: &str, args: I) -> Collaborator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Collaborator::Command(CommandSpec::new(program, args))
}

fn predictor<I, S>(program: &str, args: I) -> Collaborator
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Collaborator::Command(
        CommandSpec::new(program, args)
            .with_timeout_secs(2 * HOUR)
            .with_transient_exit_codes([TEMPFAIL_EXIT_CODE]),
    )
}

/// The catalog stage definitions, in declaration order.
#[must_use]
pub fn catalog_stages() -> Vec<StageDefinition> {
    vec![
        StageDefinition::new(
            "qc",
            [ArtifactType::RawRun],
            ArtifactType::CleanedRun,
            command("raw-qc", ["--input", "{input}", "--output", "{output}"]),
        )
        .with_description("Raw acquisition QC and cleanup"),
        StageDefinition::new(
            "convert",
            [ArtifactType::CleanedRun],
            ArtifactType::ConvertedSpectra,
            Collaborator::Command(
                CommandSpec::new(
                    "sh",
                    [
                        "-c",
                        "flag=''; [ \"$3\" = true ] && flag=--use_raw_calibration; \
                         mkdir -p \"$2\" && exec timsconvert --input \"$1\" --outdir \"$2\" \
                         --mode {config.mode} $flag --verbose",
                        "timsconvert",
                        "{input}",
                        "{output}",
                        "{config.use_raw_calibration}",
                    ],
                )
                .with_timeout_secs(4 * HOUR),
            ),
        )
        .with_description("timsTOF .d to mzML conversion")
        .with_config(
            ConfigSchema::new()
                .option(
                    OptionSpec::enumeration("mode", ["centroid", "profile", "raw"])
                        .with_default("centroid"),
                )
                .option(OptionSpec::new("use_raw_calibration", OptionKind::Boolean).with_default(true)),
        ),
        StageDefinition::new(
            "search",
            [ArtifactType::ConvertedSpectra],
            ArtifactType::SearchResults,
            Collaborator::Command(
                CommandSpec::new(
                    "{config.engine}",
                    [
                        "--headless",
                        "--manifest",
                        "{manifest}",
                        "--database",
                        "{config.database}",
                        "--input",
                        "{input}",
                        "--output",
                        "{output}",
                        "--workdir",
                        "{work_dir}",
                    ],
                )
                .with_timeout_secs(12 * HOUR),
            ),
        )
        .with_description("Database search")
        .with_config(
            ConfigSchema::new()
                .option(
                    OptionSpec::enumeration("engine", ["fragpipe", "peaks", "maxquant"])
                        .with_default("fragpipe"),
                )
                .option(
                    OptionSpec::enumeration("data_type", ["DDA", "DIA", "GPF-DIA", "DIA-Quant", "DIA-Lib"])
                        .with_default("DDA"),
                )
                .option(
                    OptionSpec::required_string("database")
                        .with_description("FASTA search database, e.g. proteome plus fusion peptides"),
                ),
        ),
        StageDefinition::new(
            "rescore",
            [ArtifactType::SearchResults],
            ArtifactType::RescoredPsms,
            predictor("prosit-rescore", ["--psms", "{input}", "--output", "{output}"]),
        )
        .with_description("Prosit rescoring of PSMs")
        .with_resource_class(GPU_RESOURCE),
        StageDefinition::new(
            "ccs",
            [ArtifactType::RescoredPsms],
            ArtifactType::CcsPredictions,
            predictor(
                "ccs-predict",
                ["--model", "{config.ccs_model}", "--psms", "{input}", "--output", "{output}"],
            ),
        )
        .with_description("Collisional cross-section prediction")
        .with_resource_class(GPU_RESOURCE)
        .with_config(ConfigSchema::new().option(
            OptionSpec::enumeration("ccs_model", ["prosit", "custom"]).with_default("prosit"),
        )),
        StageDefinition::new(
            "rt",
            [ArtifactType::RescoredPsms],
            ArtifactType::RtPredictions,
            predictor("rt-predict", ["--psms", "{input}", "--output", "{output}"]),
        )
        .with_description("Retention time prediction")
        .with_resource_class(GPU_RESOURCE),
        StageDefinition::new(
            "binding",
            [ArtifactType::RescoredPsms],
            ArtifactType::BindingAffinities,
            predictor(
                "binding-predict",
                ["--haplotype", "{config.haplotype}", "--psms", "{input}", "--output", "{output}"],
            ),
        )
        .with_description("MHC binding affinity prediction")
        .with_config(ConfigSchema::new().option(
            OptionSpec::required_string("haplotype").with_description("HLA alleles, comma separated"),
        )),
        StageDefinition::new(
            "orf",
            [ArtifactType::RescoredPsms],
            ArtifactType::OrfCalls,
            predictor("orf-predict", ["--psms", "{input}", "--output", "{output}"]),
        )
        .with_description("ORF and codon-usage calls"),
        StageDefinition::new(
            "similarity",
            [ArtifactType::RescoredPsms],
            ArtifactType::SimilarityScores,
            predictor(
                "epitope-similarity",
                [
                    "--source",
                    "{config.source}",
                    "--db",
                    "{config.epitope_db}",
                    "--psms",
                    "{input}",
                    "--output",
                    "{output}",
                ],
            ),
        )
        .with_description("Similarity to known epitopes")
        .with_config(
            ConfigSchema::new()
                .option(OptionSpec::required_string("epitope_db"))
                .option(OptionSpec::enumeration("source", ["iedb", "cedar"]).with_default("iedb")),
        ),
        StageDefinition::new(
            "rank",
            [
                ArtifactType::RescoredPsms,
                ArtifactType::CcsPredictions,
                ArtifactType::RtPredictions,
                ArtifactType::BindingAffinities,
                ArtifactType::OrfCalls,
                ArtifactType::SimilarityScores,
            ],
            ArtifactType::RankedList,
            command(
                "rank-candidates",
                [
                    "--psms",
                    "{input.0}",
                    "--ccs",
                    "{input.1}",
                    "--rt",
                    "{input.2}",
                    "--binding",
                    "{input.3}",
                    "--orf",
                    "{input.4}",
                    "--similarity",
                    "{input.5}",
                    "--output",
                    "{output}",
                ],
            ),
        )
        .with_description("Merge predictions into the ranked candidate list")
        .with_retry(RetryConfig::no_retry()),
    ]
}

/// A registry holding the catalog, with `raw_run` as the only source type.
///
/// # Errors
///
/// Only fails if the catalog itself is inconsistent.
pub fn immunopeptidomics_registry() -> Result<StageRegistry, ImmunoflowError> {
    let registry = StageRegistry::new();
    for stage in catalog_stages() {
        registry.register(stage)?;
    }
    Ok(registry)
}
