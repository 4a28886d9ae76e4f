/*!

This is the long-form manual for `response_weighting` and `weightrecon`.

## Response weight files

An administrator can supply one weight per response for a subset (survey
segment), optionally restricted to a filter context such as a wave. The file
is either an Excel spreadsheet (.xlsx, at most 10 MB) or a CSV file (at most
1 MB).

The first sheet with a header row holding the columns `ResponseId` and
`Weighting` is used. The header match ignores case and spaces, so
`response id` or `WEIGHTING` are accepted. Other columns are ignored.

Each data row must hold an integer response id and a finite weight. Other rows
are ignored and reported. A weight of zero or less can never be used: it is
reported as too small.

A template can be generated for a subset: a sheet called `Data` with one row
per expected response and a weight of 1.

### File names

Uploaded files are stored under a canonical name:

```text
{Style}.{short code + sub product}.{subset}.{metric+instance,...}.private.xlsx
```

For instance `ResponseWeighting.eatingoutuk.UK.Wave+3.private.xlsx`. Dots are
removed from the product part and characters that are not valid in a file
name are replaced by `_`. The filter part is absent for weights that apply to
the whole subset.

## Validation

Validating a file compares it with the responses expected for the subset and
the filter context:

* an expected response with a weight inside the bounds (`0.2` to `5.0` by
  default) is valid;
* an expected response with a weight outside the bounds is reported and does
  not count as valid;
* a response of the file that is not expected is reported with the most
  relevant reason: archived, in another wave, in another subset, or unknown;
* an expected response absent from the file is an error: it would get the
  default weight of 1.

A file is valid when it could be read, the subset exists and is enabled, and
no expected response is missing. A warning is added when the total weight
differs from the number of responses by more than 1%.

The error report is a spreadsheet with the columns `ResponseId`, `Weighting`,
`Reason` and `Action`. Missing responses come first. Weights outside the bounds
are in red, invalid weights have an orange background and other anomalies a
gray one.

## Pushing weights

Pushing a valid file stores one weight for every expected response: the weight
of the file, or 1 when the file does not provide a usable one. When the file
applies to a filter context, the weighting plan of the subset is extended with
the targets of that context if needed.

## Target weights

A CSV file of reference weights (`ResponseId`, `Weight`) can be turned into
target weighted plans. For every quota cell of the current rim scheme, all the
respondents must have the same weight in the file: that weight is the scale
factor of the cell. Cells with missing or differing weights are left out with a
warning. Each subset is processed on its own: a subset whose plans cannot be
converted does not prevent the others from being updated.

## Rim weighting

The rim calculator adjusts the weight of every quota cell in turn for each
dimension until the weights move by less than `0.00005` between two passes,
for at most 51 passes. It reports the minimum and maximum weights, the
weighting efficiency and either the weight of each cell or the distribution
of the weights in 50 buckets of width 0.1.

## Sample sizes

The respondent weights report lists, for every metric used by the plans, the
sample size of each category, raw and by quota. A description flags the
differences: `!n -  Missing quota cell` when a category has no quota cell and
`!!` when the raw total does not match the number of respondents.

*/
