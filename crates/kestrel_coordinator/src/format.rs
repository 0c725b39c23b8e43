use kestrel_cluster::QueryResult;

fn cell(result: &QueryResult, row: usize, col: usize) -> String {
    result.rows[row]
        .get(col)
        .map(|d| d.to_pg_text().unwrap_or_default())
        .unwrap_or_default()
}

/// psql-style aligned table followed by a row count, or the affected row
/// count for statements that returned no columns.
pub fn render(result: &QueryResult) -> String {
    if result.columns.is_empty() {
        return format!("({} affected)\n", result.affected);
    }
    let ncols = result.columns.len();
    let mut widths: Vec<usize> = result.columns.iter().map(|c| c.len()).collect();
    for row in 0..result.rows.len() {
        for (col, w) in widths.iter_mut().enumerate() {
            *w = (*w).max(cell(result, row, col).len());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = result
        .columns
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
        .collect();
    out.push_str(&format!(" {} \n", header.join(" | ")));
    let sep: Vec<String> = widths.iter().map(|w| "-".repeat(*w + 2)).collect();
    out.push_str(&format!("{}\n", sep.join("+")));
    for row in 0..result.rows.len() {
        let cells: Vec<String> = (0..ncols)
            .map(|i| format!("{:<width$}", cell(result, row, i), width = widths[i]))
            .collect();
        out.push_str(&format!(" {} \n", cells.join(" | ")));
    }
    let count = result.rows.len();
    out.push_str(&format!("({} row{})\n", count, if count == 1 { "" } else { "s" }));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_common::datum::{Datum, OwnedRow};

    #[test]
    fn test_render_table() {
        let result = QueryResult {
            columns: vec!["id".into(), "name".into()],
            rows: vec![
                OwnedRow::new(vec![Datum::Int64(1), Datum::Text("alpha".into())]),
                OwnedRow::new(vec![Datum::Int64(22), Datum::Null]),
            ],
            affected: 0,
        };
        let text = render(&result);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], " id | name  ");
        assert_eq!(lines[1], "----+-------");
        assert_eq!(lines[2], " 1  | alpha ");
        assert_eq!(lines[3], " 22 |       ");
        assert_eq!(lines[4], "(2 rows)");
    }

    #[test]
    fn test_render_command() {
        let result = QueryResult {
            affected: 5,
            ..Default::default()
        };
        assert_eq!(render(&result), "(5 affected)\n");
    }
}
