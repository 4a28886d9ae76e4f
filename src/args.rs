use clap::{Parser, Subcommand};

/// This is a program to validate, store and derive survey response weights.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// (file path) The job configuration in JSON format: the product, the store directory, the
    /// respondents file and the weighting settings. Relative paths are resolved against the
    /// directory of this file.
    #[clap(short, long, value_parser)]
    pub config: String,

    #[clap(subcommand)]
    pub command: Command,

    // Other arguments
    /// If passed as an argument, will turn on verbose logging to the standard output.
    #[clap(long, takes_value = false)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Writes a spreadsheet with the expected responses of a subset and a weight of 1.
    Template {
        #[clap(short, long, value_parser)]
        subset: String,
        /// (metric+instance id, repeatable) The filter context, for instance Wave+3.
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
        /// (file path) Defaults to the canonical name of the weight file.
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
    /// Validates the weight file of a subset. With --input, the file is uploaded first.
    Validate {
        #[clap(short, long, value_parser)]
        subset: String,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
        /// (file path, .xlsx or .csv) A new weight file to upload.
        #[clap(short, long, value_parser)]
        input: Option<String>,
        /// (file path) A reference summary in JSON format. If provided, the validation must
        /// match it.
        #[clap(short, long, value_parser)]
        reference: Option<String>,
    },
    /// Writes the error report of the weight file of a subset.
    Errors {
        #[clap(short, long, value_parser)]
        subset: String,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
    /// Stores the weights of the weight file of a subset.
    Push {
        #[clap(short, long, value_parser)]
        subset: String,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
    },
    /// Lists the uploaded weight files.
    Files,
    /// Deletes an uploaded weight file.
    Delete {
        #[clap(short, long, value_parser)]
        subset: String,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
    },
    /// Shows the weighting plans of a subset. With --input, replaces them first.
    Plans {
        #[clap(short, long, value_parser)]
        subset: String,
        /// (file path) The plans in JSON format.
        #[clap(short, long, value_parser)]
        input: Option<String>,
    },
    /// Turns a CSV file of reference weights into target weighted plans.
    Generate {
        /// (file path) The CSV file with ResponseId and Weight columns.
        #[clap(short, long, value_parser)]
        input: String,
        /// (list of comma-separated values) The subsets to update.
        #[clap(short, long, value_parser, value_delimiter = ',')]
        subsets: Vec<String>,
        /// Stores the derived plans. Without it the plans are only shown.
        #[clap(long, takes_value = false)]
        post: bool,
    },
    /// Runs the rim weighting of a subset and shows the weights.
    Rim {
        #[clap(short, long, value_parser)]
        subset: String,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
        /// Shows the weight of each quota cell instead of the distribution of the weights.
        #[clap(long, takes_value = false)]
        details: bool,
    },
    /// Writes the respondent weights report of a subset.
    SampleSizes {
        #[clap(short, long, value_parser)]
        subset: String,
        /// (list of comma-separated values) The metrics of the report.
        #[clap(short, long, value_parser, value_delimiter = ',')]
        metric: Vec<String>,
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
    /// Exports the stored response weights, restricted to the respondents
    /// matching the filters. With a single subset the completion date is left
    /// out.
    Export {
        #[clap(short, long, value_parser, value_delimiter = ',')]
        subset: Vec<String>,
        #[clap(short, long, value_parser)]
        filter: Vec<String>,
        #[clap(short, long, value_parser)]
        out: Option<String>,
    },
}
