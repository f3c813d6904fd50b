use std::path::PathBuf;

use clap::Args;

use super::CliContext;
use stepmesh::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Output directory
    #[arg(long, default_value = "schemas")]
    pub out: PathBuf,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    let written = write_schema(&args.out)?;
    for name in written {
        println!("{}", args.out.join(name).display());
    }
    println!("Schemas written to {}", args.out.display());
    Ok(())
}
