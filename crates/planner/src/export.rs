use crate::error::Result;
use crate::structure::Structure;
use csv::{Writer, WriterBuilder};
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
};

fn open_writer(path: &Path) -> Result<Writer<BufWriter<File>>> {
    if let Some(dir) = path.parent()
        && !dir.as_os_str().is_empty()
    {
        std::fs::create_dir_all(dir)?;
    }
    let file = File::create(path)?;

    #[allow(unused_mut)]
    let mut builder = WriterBuilder::new();
    #[cfg(windows)]
    {
        use csv::Terminator;
        builder = builder.terminator(Terminator::CRLF);
    }
    Ok(builder.from_writer(BufWriter::new(file)))
}

/// One row per (structure, DVH point). Structures without a computed dose
/// are skipped.
pub fn write_dvh_csv(path: impl AsRef<Path>, structures: &[Structure]) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut wtr = open_writer(path)?;

    wtr.write_record(["Label", "Name", "Dose", "Percentile"])?;
    for s in structures {
        let plot = s.dvh_curve().plotting_data();
        let label = s.label().to_string();
        for (dose, pct) in plot.dose.iter().zip(&plot.percentile) {
            let dose_s = format!("{:.6}", dose);
            let pct_s = format!("{:.4}", pct);
            wtr.write_record([
                label.as_str(),
                s.name.as_str(),
                dose_s.as_str(),
                pct_s.as_str(),
            ])?;
        }
    }

    wtr.flush()?;
    log::info!("wrote DVH curves to {}", path.display());
    Ok(path.to_path_buf())
}

/// One row per structure with a computed dose.
pub fn write_summary_csv(path: impl AsRef<Path>, structures: &[Structure]) -> Result<PathBuf> {
    let path = path.as_ref();
    let mut wtr = open_writer(path)?;

    wtr.write_record([
        "Label", "Name", "Target", "Mean", "Std", "Min", "Max", "D2", "D50", "D98", "HI",
    ])?;
    for s in structures {
        let Some(t) = s.dose_summary().table_data() else {
            continue;
        };
        let mut record = vec![
            s.label().to_string(),
            s.name.clone(),
            s.is_target().to_string(),
        ];
        record.extend(
            [t.mean, t.std, t.min, t.max, t.d2, t.d50, t.d98, t.homogeneity_index]
                .iter()
                .map(|v| format!("{:.6}", v)),
        );
        wtr.write_record(&record)?;
    }

    wtr.flush()?;
    log::info!("wrote dose summary to {}", path.display());
    Ok(path.to_path_buf())
}
