use clap::{Parser, Subcommand};

use crate::semantic::{IngestItem, SearchTarget};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the HTTP API
    Serve {
        /// Address to listen on, overrides the config
        #[clap(short, long)]
        listen: Option<String>,
    },

    /// Create an empty index for a collection
    CreateIndex {
        #[clap(short, long)]
        owner: u64,

        #[clap(short, long)]
        collection: u64,
    },

    /// Embed image files and append them to a collection's index
    Embed {
        #[clap(short, long)]
        owner: u64,

        #[clap(short, long)]
        collection: u64,

        /// Images as ID=PATH
        #[clap(required = true, value_parser = parse_item)]
        images: Vec<IngestItem>,
    },

    /// Search collections with a text query
    Search {
        query: String,

        /// Number of results
        #[clap(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// Collection to search as COLLECTION:OWNER, repeatable
        #[clap(short, long = "target", value_parser = parse_target)]
        targets: Vec<SearchTarget>,
    },

    /// Delete a collection's index; succeeds if it is already gone
    DeleteIndex {
        #[clap(short, long)]
        owner: u64,

        #[clap(short, long)]
        collection: u64,
    },

    /// Replay requests that failed while the engine was unavailable
    RetryFailed {},

    /// List requests waiting for a retry
    Failed {},
}

fn parse_item(value: &str) -> Result<IngestItem, String> {
    let (id, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected ID=PATH, got {value:?}"))?;
    let id = id
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid image id {id:?}: {e}"))?;
    if path.is_empty() {
        return Err(format!("missing path for image {id}"));
    }

    Ok(IngestItem {
        id,
        file_path: path.to_string(),
    })
}

fn parse_target(value: &str) -> Result<SearchTarget, String> {
    let (collection, owner) = value
        .split_once(':')
        .ok_or_else(|| format!("expected COLLECTION:OWNER, got {value:?}"))?;
    let parse = |s: &str, what: &str| {
        s.trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid {what} id {s:?}: {e}"))
    };

    Ok(SearchTarget {
        collection_id: parse(collection, "collection")?,
        owner_id: parse(owner, "owner")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_item() {
        let item = parse_item("42=images/a.png").unwrap();
        assert_eq!(item.id, 42);
        assert_eq!(item.file_path, "images/a.png");

        // only the first '=' separates
        let item = parse_item("1=/tmp/a=b.png").unwrap();
        assert_eq!(item.file_path, "/tmp/a=b.png");

        assert!(parse_item("images/a.png").is_err());
        assert!(parse_item("x=images/a.png").is_err());
        assert!(parse_item("3=").is_err());
    }

    #[test]
    fn test_parse_target() {
        let target = parse_target("10:1").unwrap();
        assert_eq!(target.collection_id, 10);
        assert_eq!(target.owner_id, 1);

        assert!(parse_target("10").is_err());
        assert!(parse_target("a:1").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "folio", "search", "red car", "-k", "3", "-t", "10:1", "-t", "20:2",
        ])
        .unwrap();

        match args.command {
            Command::Search {
                query,
                top_k,
                targets,
            } => {
                assert_eq!(query, "red car");
                assert_eq!(top_k, 3);
                assert_eq!(targets.len(), 2);
                assert_eq!(targets[1].owner_id, 2);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
